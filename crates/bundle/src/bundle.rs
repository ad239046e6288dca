//! Bundles and their entries.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bulkput_store::{EntryKind, path};
use bulkput_transfer::checksum_strings;

use crate::error::{BundleError, Stage};
use crate::staging;

/// Hash input used for a bundle with no members.
const EMPTY_BUNDLE_SENTINEL: &str = "empty_bundle";

/// One scheduled file or directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub local_path: PathBuf,
    pub remote_path: String,
    /// Bytes; 0 for directories.
    pub size: i64,
    pub kind: EntryKind,
    pub mod_time: Option<SystemTime>,
}

impl Entry {
    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Dir
    }
}

/// Archive file name for an ordered list of member paths.
pub fn bundle_archive_name<P: AsRef<Path>>(members: &[P]) -> String {
    let mut parts = Vec::with_capacity(members.len() + 1);
    parts.push(EMPTY_BUNDLE_SENTINEL.to_string());
    parts.extend(
        members
            .iter()
            .map(|p| p.as_ref().to_string_lossy().into_owned()),
    );
    staging::bundle_filename(&checksum_strings(&parts))
}

/// Bundle still accepting entries. Owned by the assembler.
#[derive(Debug)]
pub(crate) struct OpenBundle {
    index: u64,
    entries: Vec<Entry>,
    size: i64,
}

impl OpenBundle {
    pub(crate) fn new(index: u64) -> Self {
        Self {
            index,
            entries: Vec::new(),
            size: 0,
        }
    }

    pub(crate) fn index(&self) -> u64 {
        self.index
    }

    pub(crate) fn push(&mut self, entry: Entry) {
        self.size += entry.size;
        self.entries.push(entry);
    }

    pub(crate) fn is_full(&self, max_count: usize, max_size: i64) -> bool {
        self.size >= max_size || self.entries.len() >= max_count
    }

    /// Freezes the entry list and derives the archive paths.
    pub(crate) fn seal(
        self,
        min_archive_count: usize,
        local_temp_dir: &Path,
        staging_dir: &str,
    ) -> Bundle {
        let locals: Vec<&Path> = self.entries.iter().map(|e| e.local_path.as_path()).collect();
        let archive_name = bundle_archive_name(&locals);
        Bundle {
            index: self.index,
            require_archive: self.entries.len() >= min_archive_count,
            local_archive_path: local_temp_dir.join(&archive_name),
            remote_archive_path: path::join(staging_dir, &archive_name),
            archive_name,
            entries: self.entries,
            size: self.size,
            failure: Mutex::new(None),
        }
    }
}

/// Sealed bundle moving through the pipeline.
#[derive(Debug)]
pub struct Bundle {
    index: u64,
    entries: Vec<Entry>,
    size: i64,
    archive_name: String,
    local_archive_path: PathBuf,
    remote_archive_path: String,
    require_archive: bool,
    failure: Mutex<Option<(Stage, Arc<BundleError>)>>,
}

impl Bundle {
    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of member file sizes.
    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn archive_name(&self) -> &str {
        &self.archive_name
    }

    pub fn local_archive_path(&self) -> &Path {
        &self.local_archive_path
    }

    pub fn remote_archive_path(&self) -> &str {
        &self.remote_archive_path
    }

    /// True when members travel as one archive instead of one by one.
    pub fn require_archive(&self) -> bool {
        self.require_archive
    }

    /// Last recorded failure and the stage it happened in.
    pub fn last_error(&self) -> Option<(Stage, Arc<BundleError>)> {
        self.failure.lock().unwrap().clone()
    }

    pub(crate) fn record_failure(&self, stage: Stage, err: Arc<BundleError>) {
        *self.failure.lock().unwrap() = Some((stage, err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(local: &str, size: i64) -> Entry {
        Entry {
            local_path: PathBuf::from(local),
            remote_path: format!("/zone/home/alice/dest{local}"),
            size,
            kind: EntryKind::File,
            mod_time: None,
        }
    }

    #[test]
    fn full_on_count_or_size() {
        let mut open = OpenBundle::new(0);
        assert!(!open.is_full(2, 100));
        open.push(file("/a", 10));
        assert!(!open.is_full(2, 100));
        open.push(file("/b", 10));
        assert!(open.is_full(2, 100));

        let mut big = OpenBundle::new(1);
        big.push(file("/c", 100));
        assert!(big.is_full(50, 100));
    }

    #[test]
    fn archive_name_depends_on_ordered_members() {
        let ab = bundle_archive_name(&["/a", "/b"]);
        assert_eq!(ab, bundle_archive_name(&["/a", "/b"]));
        assert_ne!(ab, bundle_archive_name(&["/b", "/a"]));
        assert!(staging::is_bundle_filename(&ab));

        let empty: [&str; 0] = [];
        assert_ne!(bundle_archive_name(&empty), ab);
    }

    #[test]
    fn seal_derives_paths_and_archive_flag() {
        let mut open = OpenBundle::new(4);
        open.push(file("/a", 1));
        open.push(file("/b", 2));
        let small = open.seal(3, Path::new("/tmp/work"), "/zone/home/alice/dest/.bulkput_staging");
        assert_eq!(small.index(), 4);
        assert_eq!(small.size(), 3);
        assert!(!small.require_archive());
        assert_eq!(
            small.local_archive_path(),
            Path::new("/tmp/work").join(small.archive_name())
        );
        assert_eq!(
            small.remote_archive_path(),
            format!("/zone/home/alice/dest/.bulkput_staging/{}", small.archive_name())
        );

        let mut open = OpenBundle::new(5);
        for name in ["/a", "/b", "/c"] {
            open.push(file(name, 1));
        }
        assert!(open.seal(3, Path::new("/tmp"), "/z/h/u/s").require_archive());
    }

    #[test]
    fn failure_is_recorded() {
        let bundle = OpenBundle::new(0).seal(3, Path::new("/tmp"), "/z/h/u/s");
        assert!(bundle.last_error().is_none());
        bundle.record_failure(Stage::Upload, Arc::new(BundleError::PipelineClosed));
        let (stage, _) = bundle.last_error().unwrap();
        assert_eq!(stage, Stage::Upload);
    }
}
