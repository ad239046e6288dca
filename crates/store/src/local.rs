//! [`RemoteStore`] backed by a local directory.
//!
//! Remote path `/` maps to the store root; every other absolute remote path
//! maps to the matching path below it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bulkput_transfer::{
    DEFAULT_CHUNK_SIZE, RangeReader, RangeWriter, calculate_file_checksum, unpack_archive,
};
use tokio::task::JoinSet;
use tracing::debug;

use crate::error::StoreError;
use crate::path;
use crate::remote::{RemoteStore, StoreFuture};
use crate::types::{ArchiveKind, ByteProgressFn, EntryKind, RemoteEntry, UploadOptions};

/// Directory-backed store.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
    checksums: bool,
    chunk_size: usize,
}

async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Remote(format!("task join error: {e}")))?
}

fn entry_for(remote: &str, full: &Path, checksums: bool) -> Result<Option<RemoteEntry>, StoreError> {
    let meta = match std::fs::metadata(full) {
        Ok(m) => m,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let (kind, size, checksum) = if meta.is_dir() {
        (EntryKind::Dir, 0, None)
    } else {
        let checksum = if checksums {
            Some(calculate_file_checksum(full)?)
        } else {
            None
        };
        (EntryKind::File, meta.len() as i64, checksum)
    };
    Ok(Some(RemoteEntry {
        path: remote.to_string(),
        name: path::file_name(remote).to_string(),
        kind,
        size,
        checksum,
    }))
}

impl LocalStore {
    /// Creates a store rooted at `root`. The directory is created if missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            checksums: true,
            chunk_size: DEFAULT_CHUNK_SIZE,
        })
    }

    /// Stops computing content checksums on `stat`/`list`.
    pub fn without_checksums(mut self) -> Self {
        self.checksums = false;
        self
    }

    /// Overrides the upload chunk size.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Local directory backing `/`.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of `remote` relative to the root (empty for `/`).
    fn relative(&self, remote: &str) -> Result<String, StoreError> {
        if !path::is_absolute(remote) {
            return Err(StoreError::InvalidPath(format!("not absolute: {remote}")));
        }
        let cleaned = path::clean(remote);
        if cleaned.split('/').any(|c| c == "..") {
            return Err(StoreError::InvalidPath(format!("parent traversal: {remote}")));
        }
        Ok(cleaned.trim_start_matches('/').to_string())
    }

    /// Maps an absolute remote path onto the local filesystem.
    pub fn resolve(&self, remote: &str) -> Result<PathBuf, StoreError> {
        let rel = self.relative(remote)?;
        if rel.is_empty() {
            Ok(self.root.clone())
        } else {
            Ok(self.root.join(rel))
        }
    }

    fn check_upload_target(&self, remote: &str, overwrite: bool) -> Result<String, StoreError> {
        let rel = self.relative(remote)?;
        if rel.is_empty() {
            return Err(StoreError::WrongKind {
                path: remote.to_string(),
                expected: EntryKind::File,
            });
        }
        let full = self.root.join(&rel);
        let parent = full.parent().unwrap_or(&self.root);
        if !parent.is_dir() {
            return Err(StoreError::NotFound(path::parent(remote)));
        }
        if full.is_dir() {
            return Err(StoreError::WrongKind {
                path: remote.to_string(),
                expected: EntryKind::File,
            });
        }
        if full.exists() && !overwrite {
            return Err(StoreError::AlreadyExists(remote.to_string()));
        }
        Ok(rel)
    }
}

impl RemoteStore for LocalStore {
    fn make_dir<'a>(&'a self, path: &'a str, recursive: bool) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            let remote = path.to_string();
            blocking(move || {
                if full.is_dir() {
                    return Ok(());
                }
                if full.exists() {
                    return Err(StoreError::WrongKind {
                        path: remote,
                        expected: EntryKind::Dir,
                    });
                }
                if recursive {
                    std::fs::create_dir_all(&full)?;
                } else {
                    std::fs::create_dir(&full).map_err(|e| {
                        if e.kind() == std::io::ErrorKind::NotFound {
                            StoreError::NotFound(path::parent(&remote))
                        } else {
                            e.into()
                        }
                    })?;
                }
                Ok(())
            })
            .await
        })
    }

    fn stat<'a>(&'a self, path: &'a str) -> StoreFuture<'a, Option<RemoteEntry>> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            let remote = path::clean(path);
            let checksums = self.checksums;
            blocking(move || entry_for(&remote, &full, checksums)).await
        })
    }

    fn list<'a>(&'a self, path: &'a str) -> StoreFuture<'a, Vec<RemoteEntry>> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            let remote = path::clean(path);
            let checksums = self.checksums;
            blocking(move || {
                if !full.exists() {
                    return Err(StoreError::NotFound(remote));
                }
                if !full.is_dir() {
                    return Err(StoreError::WrongKind {
                        path: remote,
                        expected: EntryKind::Dir,
                    });
                }
                let mut entries = Vec::new();
                for item in std::fs::read_dir(&full)? {
                    let item = item?;
                    let name = item.file_name().to_string_lossy().into_owned();
                    let child = path::join(&remote, &name);
                    if let Some(entry) = entry_for(&child, &item.path(), checksums)? {
                        entries.push(entry);
                    }
                }
                entries.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(entries)
            })
            .await
        })
    }

    fn upload_file<'a>(
        &'a self,
        local: &'a Path,
        remote: &'a str,
        options: &'a UploadOptions,
        progress: Option<ByteProgressFn>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let rel = self.check_upload_target(remote, options.overwrite)?;
            let root = self.root.clone();
            let local = local.to_path_buf();
            let chunk_size = self.chunk_size;
            debug!(local = %local.display(), remote = %remote, "uploading file");

            blocking(move || {
                let reader = RangeReader::open(&local, chunk_size)?;
                let total = reader.file_size();
                let mut writer = RangeWriter::create(&root, &rel, total)?;
                if let Some(cb) = &progress {
                    cb(0, total);
                }
                for chunk in reader {
                    writer.write(&chunk?)?;
                    if let Some(cb) = &progress {
                        cb(writer.written(), total);
                    }
                }
                Ok(())
            })
            .await
        })
    }

    fn upload_file_parallel<'a>(
        &'a self,
        local: &'a Path,
        remote: &'a str,
        options: &'a UploadOptions,
        threads: usize,
        progress: Option<ByteProgressFn>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let rel = self.check_upload_target(remote, options.overwrite)?;
            let total = tokio::fs::metadata(local).await?.len() as i64;
            let threads = threads.max(1) as i64;
            debug!(local = %local.display(), remote = %remote, threads, "uploading file in parallel");

            {
                let root = self.root.clone();
                let rel = rel.clone();
                blocking(move || {
                    RangeWriter::create(&root, &rel, total)?;
                    Ok(())
                })
                .await?;
            }
            if let Some(cb) = &progress {
                cb(0, total);
            }

            let span = (total + threads - 1) / threads;
            let sent = Arc::new(AtomicI64::new(0));
            let mut tasks = JoinSet::new();
            let mut start = 0;
            while start < total {
                let len = span.min(total - start);
                let root = self.root.clone();
                let rel = rel.clone();
                let local = local.to_path_buf();
                let chunk_size = self.chunk_size;
                let sent = Arc::clone(&sent);
                let progress = progress.clone();
                tasks.spawn_blocking(move || -> Result<(), StoreError> {
                    let reader = RangeReader::range(&local, chunk_size, start, len)?;
                    let mut writer = RangeWriter::open(&root, &rel)?;
                    for chunk in reader {
                        let chunk = chunk?;
                        let size = chunk.len() as i64;
                        writer.write(&chunk)?;
                        let done = sent.fetch_add(size, Ordering::SeqCst) + size;
                        if let Some(cb) = &progress {
                            cb(done, total);
                        }
                    }
                    Ok(())
                });
                start += len;
            }

            let mut first_err = None;
            while let Some(joined) = tasks.join_next().await {
                let result = joined
                    .map_err(|e| StoreError::Remote(format!("task join error: {e}")))
                    .and_then(|r| r);
                if let Err(e) = result
                    && first_err.is_none()
                {
                    first_err = Some(e);
                }
            }
            match first_err {
                Some(e) => Err(e),
                None => Ok(()),
            }
        })
    }

    fn supports_parallel_upload(&self) -> bool {
        true
    }

    fn remove_file<'a>(&'a self, path: &'a str, _force: bool) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let full = self.resolve(path)?;
            let remote = path.to_string();
            blocking(move || {
                if full.is_dir() {
                    return Err(StoreError::WrongKind {
                        path: remote,
                        expected: EntryKind::File,
                    });
                }
                std::fs::remove_file(&full).map_err(|e| {
                    if e.kind() == std::io::ErrorKind::NotFound {
                        StoreError::NotFound(remote)
                    } else {
                        e.into()
                    }
                })
            })
            .await
        })
    }

    fn remove_dir<'a>(
        &'a self,
        path: &'a str,
        recursive: bool,
        _force: bool,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if self.relative(path)?.is_empty() {
                return Err(StoreError::InvalidPath("refusing to remove /".into()));
            }
            let full = self.resolve(path)?;
            let remote = path.to_string();
            blocking(move || {
                if !full.exists() {
                    return Err(StoreError::NotFound(remote));
                }
                if !full.is_dir() {
                    return Err(StoreError::WrongKind {
                        path: remote,
                        expected: EntryKind::Dir,
                    });
                }
                if recursive {
                    std::fs::remove_dir_all(&full)?;
                } else {
                    std::fs::remove_dir(&full)?;
                }
                Ok(())
            })
            .await
        })
    }

    fn extract_archive<'a>(
        &'a self,
        archive: &'a str,
        dest: &'a str,
        kind: ArchiveKind,
        _bulk_registration: bool,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let archive_path = self.resolve(archive)?;
            let dest_path = self.resolve(dest)?;
            let remote = archive.to_string();
            debug!(archive = %archive, dest = %dest, kind = %kind, "extracting archive");
            blocking(move || {
                if !archive_path.is_file() {
                    return Err(StoreError::NotFound(remote));
                }
                match kind {
                    ArchiveKind::Tar => unpack_archive(&archive_path, &dest_path)?,
                }
                Ok(())
            })
            .await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::TempDir;

    fn store(tmp: &TempDir) -> LocalStore {
        LocalStore::new(tmp.path().join("remote")).unwrap()
    }

    fn local_file(tmp: &TempDir, name: &str, data: &[u8]) -> PathBuf {
        let path = tmp.path().join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn resolve_maps_under_root() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        assert_eq!(s.resolve("/").unwrap(), s.root());
        assert_eq!(s.resolve("/zone/a").unwrap(), s.root().join("zone/a"));
        assert!(s.resolve("relative").is_err());
        assert!(s.resolve("/zone/../../etc").is_err());
    }

    #[tokio::test]
    async fn make_dir_and_stat() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        assert!(s.stat("/zone/home").await.unwrap().is_none());

        let err = s.make_dir("/zone/home", false).await.unwrap_err();
        assert!(err.is_not_found());

        s.make_dir("/zone/home", true).await.unwrap();
        let entry = s.stat("/zone/home").await.unwrap().unwrap();
        assert!(entry.is_dir());
        assert_eq!(entry.name, "home");
        assert!(s.exists_dir("/zone/home").await.unwrap());
        assert!(!s.exists_file("/zone/home").await.unwrap());
    }

    #[tokio::test]
    async fn upload_then_list_with_checksums() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).with_chunk_size(3);
        s.make_dir("/zone/dest", true).await.unwrap();
        let src = local_file(&tmp, "a.dat", b"hello world");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let cb_seen = Arc::clone(&seen);
        let cb: ByteProgressFn = Arc::new(move |p, t| cb_seen.lock().unwrap().push((p, t)));
        s.upload_file(&src, "/zone/dest/a.dat", &UploadOptions::default(), Some(cb))
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.first(), Some(&(0, 11)));
        assert_eq!(seen.last(), Some(&(11, 11)));

        let entries = s.list("/zone/dest").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/zone/dest/a.dat");
        assert_eq!(entries[0].size, 11);
        assert_eq!(
            entries[0].checksum.as_deref(),
            Some(bulkput_transfer::checksum_bytes(b"hello world").as_str())
        );
    }

    #[tokio::test]
    async fn upload_respects_overwrite_flag() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        s.make_dir("/d", true).await.unwrap();
        let first = local_file(&tmp, "first", b"first version");
        let second = local_file(&tmp, "second", b"v2");

        s.upload_file(&first, "/d/f", &UploadOptions::default(), None)
            .await
            .unwrap();
        let err = s
            .upload_file(&second, "/d/f", &UploadOptions::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));

        let overwrite = UploadOptions {
            overwrite: true,
            ..Default::default()
        };
        s.upload_file(&second, "/d/f", &overwrite, None).await.unwrap();
        assert_eq!(std::fs::read(s.resolve("/d/f").unwrap()).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn upload_requires_parent() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        let src = local_file(&tmp, "a", b"x");
        let err = s
            .upload_file(&src, "/missing/a", &UploadOptions::default(), None)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn parallel_upload_reassembles_file() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp).with_chunk_size(7);
        s.make_dir("/d", true).await.unwrap();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let src = local_file(&tmp, "big", &data);

        let last = Arc::new(AtomicI64::new(0));
        let l = Arc::clone(&last);
        let cb: ByteProgressFn = Arc::new(move |p, _| {
            l.fetch_max(p, Ordering::SeqCst);
        });
        s.upload_file_parallel(&src, "/d/big", &UploadOptions::default(), 4, Some(cb))
            .await
            .unwrap();

        assert_eq!(std::fs::read(s.resolve("/d/big").unwrap()).unwrap(), data);
        assert_eq!(last.load(Ordering::SeqCst), 1000);
    }

    #[tokio::test]
    async fn remove_checks_kind() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        s.make_dir("/d/sub", true).await.unwrap();

        let err = s.remove_file("/d/sub", true).await.unwrap_err();
        assert!(matches!(err, StoreError::WrongKind { .. }));
        assert!(s.remove_file("/d/nope", true).await.unwrap_err().is_not_found());

        s.remove_dir("/d", true, true).await.unwrap();
        assert!(s.stat("/d").await.unwrap().is_none());
        assert!(s.remove_dir("/", true, true).await.is_err());
    }

    #[tokio::test]
    async fn extract_unpacks_tar() {
        let tmp = TempDir::new().unwrap();
        let s = store(&tmp);
        let base = tmp.path().join("src");
        std::fs::create_dir_all(base.join("x")).unwrap();
        std::fs::write(base.join("x/one.dat"), b"1").unwrap();
        let tar_path = tmp.path().join("b.tar");
        bulkput_transfer::create_archive(&base, &[base.join("x/one.dat")], &tar_path, None)
            .unwrap();

        s.make_dir("/dest/.staging", true).await.unwrap();
        s.upload_file(&tar_path, "/dest/.staging/b.tar", &UploadOptions::default(), None)
            .await
            .unwrap();
        s.extract_archive("/dest/.staging/b.tar", "/dest", ArchiveKind::Tar, true)
            .await
            .unwrap();

        let entry = s.stat("/dest/x/one.dat").await.unwrap().unwrap();
        assert_eq!(entry.size, 1);
    }
}
