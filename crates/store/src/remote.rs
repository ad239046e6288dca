//! The remote store interface consumed by the pipeline.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use crate::error::StoreError;
use crate::types::{ArchiveKind, ByteProgressFn, RemoteEntry, UploadOptions};

/// Boxed future returned by every [`RemoteStore`] method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Abstract hierarchical data store.
///
/// Implementations own their connection pooling and timeouts. Paths are
/// absolute and `/`-separated.
pub trait RemoteStore: Send + Sync {
    /// Creates a directory, with its missing parents when `recursive`.
    fn make_dir<'a>(&'a self, path: &'a str, recursive: bool) -> StoreFuture<'a, ()>;

    /// Looks up one path; `None` when it does not exist.
    fn stat<'a>(&'a self, path: &'a str) -> StoreFuture<'a, Option<RemoteEntry>>;

    /// Lists the direct children of a directory.
    fn list<'a>(&'a self, path: &'a str) -> StoreFuture<'a, Vec<RemoteEntry>>;

    fn exists_dir<'a>(&'a self, path: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.stat(path).await?.is_some_and(|e| e.is_dir())) })
    }

    fn exists_file<'a>(&'a self, path: &'a str) -> StoreFuture<'a, bool> {
        Box::pin(async move { Ok(self.stat(path).await?.is_some_and(|e| e.is_file())) })
    }

    /// Uploads one local file over a single stream.
    fn upload_file<'a>(
        &'a self,
        local: &'a Path,
        remote: &'a str,
        options: &'a UploadOptions,
        progress: Option<ByteProgressFn>,
    ) -> StoreFuture<'a, ()>;

    /// Uploads one local file over `threads` concurrent streams.
    ///
    /// Stores without parallel support fall back to [`upload_file`](Self::upload_file).
    fn upload_file_parallel<'a>(
        &'a self,
        local: &'a Path,
        remote: &'a str,
        options: &'a UploadOptions,
        threads: usize,
        progress: Option<ByteProgressFn>,
    ) -> StoreFuture<'a, ()> {
        let _ = threads;
        self.upload_file(local, remote, options, progress)
    }

    fn supports_parallel_upload(&self) -> bool {
        false
    }

    fn remove_file<'a>(&'a self, path: &'a str, force: bool) -> StoreFuture<'a, ()>;

    fn remove_dir<'a>(&'a self, path: &'a str, recursive: bool, force: bool)
    -> StoreFuture<'a, ()>;

    /// Extracts an uploaded archive into `dest` on the store side.
    fn extract_archive<'a>(
        &'a self,
        archive: &'a str,
        dest: &'a str,
        kind: ArchiveKind,
        bulk_registration: bool,
    ) -> StoreFuture<'a, ()>;
}
