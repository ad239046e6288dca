//! Run configuration.

use std::path::PathBuf;

use bulkput_store::path;
use serde::{Deserialize, Serialize};

use crate::error::BundleError;
use crate::staging;

pub const MAX_BUNDLE_COUNT_DEFAULT: usize = 50;
pub const MAX_BUNDLE_SIZE_DEFAULT: i64 = 2 * 1024 * 1024 * 1024;
pub const MIN_ARCHIVE_COUNT_DEFAULT: usize = 3;
pub const UPLOAD_THREADS_DEFAULT: usize = 5;
pub const UPLOAD_THREADS_MAX: usize = 20;

/// How single files are pushed to the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    /// Parallel streams for large files when the store supports them.
    #[default]
    Auto,
    Single,
    Parallel,
}

/// Settings for one bundled upload run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Seal a bundle once it holds this many entries.
    #[serde(default = "default_max_bundle_count")]
    pub max_bundle_count: usize,

    /// Seal a bundle once its files add up to this many bytes.
    #[serde(default = "default_max_bundle_size")]
    pub max_bundle_size: i64,

    /// Bundles with fewer entries are uploaded file by file.
    #[serde(default = "default_min_archive_count")]
    pub min_archive_count: usize,

    /// Upload worker count, clamped to `1..=20`.
    #[serde(default = "default_upload_threads")]
    pub upload_threads: usize,

    #[serde(default)]
    pub transfer_mode: TransferMode,

    /// Stream cap for one parallel file upload.
    #[serde(default = "default_max_threads_per_file")]
    pub max_threads_per_file: usize,

    /// Where bundle archives are written before upload.
    #[serde(default = "default_local_temp_dir")]
    pub local_temp_dir: PathBuf,

    /// Remote directory for uploaded archives awaiting extraction.
    /// Defaults to a hidden directory inside `remote_dest`.
    #[serde(default)]
    pub remote_staging_dir: Option<String>,

    /// Skip entries already present and unchanged at the destination.
    #[serde(default)]
    pub different_files_only: bool,

    /// Compare sizes only in difference mode.
    #[serde(default)]
    pub no_hash: bool,

    /// Let the store overwrite existing files in place instead of removing
    /// them first. Directories in the way are removed either way.
    #[serde(default)]
    pub force: bool,

    /// Compare the store's checksum with the local file after each upload.
    #[serde(default)]
    pub verify_checksum: bool,

    #[serde(default)]
    pub no_bulk_registration: bool,

    #[serde(default)]
    pub resource: Option<String>,

    #[serde(default)]
    pub replicate: bool,

    /// Local directory that maps onto `remote_dest`.
    #[serde(default = "default_local_root")]
    pub local_root: PathBuf,

    /// Absolute remote destination directory.
    #[serde(default)]
    pub remote_dest: String,
}

fn default_max_bundle_count() -> usize {
    MAX_BUNDLE_COUNT_DEFAULT
}

fn default_max_bundle_size() -> i64 {
    MAX_BUNDLE_SIZE_DEFAULT
}

fn default_min_archive_count() -> usize {
    MIN_ARCHIVE_COUNT_DEFAULT
}

fn default_upload_threads() -> usize {
    UPLOAD_THREADS_DEFAULT
}

fn default_max_threads_per_file() -> usize {
    4
}

fn default_local_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_local_root() -> PathBuf {
    PathBuf::from("/")
}

impl Default for BundleConfig {
    fn default() -> Self {
        Self {
            max_bundle_count: default_max_bundle_count(),
            max_bundle_size: default_max_bundle_size(),
            min_archive_count: default_min_archive_count(),
            upload_threads: default_upload_threads(),
            transfer_mode: TransferMode::default(),
            max_threads_per_file: default_max_threads_per_file(),
            local_temp_dir: default_local_temp_dir(),
            remote_staging_dir: None,
            different_files_only: false,
            no_hash: false,
            force: false,
            verify_checksum: false,
            no_bulk_registration: false,
            resource: None,
            replicate: false,
            local_root: default_local_root(),
            remote_dest: String::new(),
        }
    }
}

impl BundleConfig {
    /// Upload worker count after clamping.
    pub fn upload_thread_count(&self) -> usize {
        self.upload_threads.clamp(1, UPLOAD_THREADS_MAX)
    }

    /// Cleaned remote destination.
    pub fn dest_dir(&self) -> String {
        path::clean(&self.remote_dest)
    }

    /// Remote staging directory in effect.
    pub fn staging_dir(&self) -> String {
        match &self.remote_staging_dir {
            Some(dir) => path::clean(dir),
            None => staging::default_staging_dir(&self.remote_dest),
        }
    }

    /// True when archives are staged in the default in-destination directory.
    pub fn uses_default_staging(&self) -> bool {
        self.staging_dir() == staging::default_staging_dir(&self.remote_dest)
    }

    /// Rejects settings the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), BundleError> {
        if self.max_bundle_count == 0 {
            return Err(BundleError::Config("max_bundle_count must be at least 1".into()));
        }
        if self.max_bundle_size <= 0 {
            return Err(BundleError::Config("max_bundle_size must be positive".into()));
        }
        if self.min_archive_count == 0 {
            return Err(BundleError::Config("min_archive_count must be at least 1".into()));
        }
        if !path::is_absolute(&self.remote_dest) {
            return Err(BundleError::Config(format!(
                "remote destination must be absolute: {:?}",
                self.remote_dest
            )));
        }
        if !self.local_root.is_absolute() {
            return Err(BundleError::Config(format!(
                "local root must be absolute: {}",
                self.local_root.display()
            )));
        }
        staging::check_staging_dir(&self.staging_dir())
    }
}
