//! Memoized metadata lookups in front of a [`RemoteStore`].
//!
//! Entries never expire. Writers that mutate a path through the store must
//! call [`MetadataCache::invalidate`]; changes made by anyone else are not
//! noticed. Readers may therefore observe stale results.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::StoreError;
use crate::path;
use crate::remote::RemoteStore;
use crate::types::RemoteEntry;

/// Paths at or above this depth are stat'd directly instead of through a
/// listing of their parent.
pub const DIRECT_STAT_DEPTH: usize = 3;

/// Shared existence/stat/listing cache.
pub struct MetadataCache {
    store: Arc<dyn RemoteStore>,
    inner: Mutex<CacheInner>,
}

#[derive(Default)]
struct CacheInner {
    /// `None` records a known-missing path.
    stats: HashMap<String, Option<RemoteEntry>>,
    listings: HashMap<String, Vec<RemoteEntry>>,
    /// Paths dropped from a cached parent listing; resolved by direct stat.
    invalidated: HashSet<String>,
}

enum Lookup {
    Hit(Option<RemoteEntry>),
    Direct,
    ListParent(String),
}

impl MetadataCache {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// The store behind this cache.
    pub fn store(&self) -> &Arc<dyn RemoteStore> {
        &self.store
    }

    /// Lists a directory, caching the listing and every child's stat.
    pub async fn list_dir(&self, dir: &str) -> Result<Vec<RemoteEntry>, StoreError> {
        let dir = path::clean(dir);
        if let Some(entries) = self.inner.lock().unwrap().listings.get(&dir) {
            return Ok(entries.clone());
        }

        let entries = self.store.list(&dir).await?;

        let mut inner = self.inner.lock().unwrap();
        for entry in &entries {
            inner.invalidated.remove(&entry.path);
            inner.stats.insert(entry.path.clone(), Some(entry.clone()));
        }
        inner.listings.insert(dir, entries.clone());
        Ok(entries)
    }

    /// Looks up one path; `Ok(None)` when it does not exist.
    pub async fn stat(&self, target: &str) -> Result<Option<RemoteEntry>, StoreError> {
        let target = path::clean(target);
        let lookup = {
            let inner = self.inner.lock().unwrap();
            if let Some(hit) = inner.stats.get(&target) {
                Lookup::Hit(hit.clone())
            } else if path::depth(&target) <= DIRECT_STAT_DEPTH
                || inner.invalidated.contains(&target)
            {
                Lookup::Direct
            } else {
                let parent = path::parent(&target);
                match inner.stats.get(&parent) {
                    Some(None) => Lookup::Hit(None),
                    _ => match inner.listings.get(&parent) {
                        Some(listing) => {
                            Lookup::Hit(listing.iter().find(|e| e.path == target).cloned())
                        }
                        None => Lookup::ListParent(parent),
                    },
                }
            }
        };

        match lookup {
            Lookup::Hit(entry) => Ok(entry),
            Lookup::Direct => self.stat_direct(&target).await,
            Lookup::ListParent(parent) => match self.list_dir(&parent).await {
                Ok(entries) => {
                    let found = entries.into_iter().find(|e| e.path == target);
                    if found.is_none() {
                        self.inner.lock().unwrap().stats.insert(target, None);
                    }
                    Ok(found)
                }
                Err(e) if e.is_not_found() => {
                    let mut inner = self.inner.lock().unwrap();
                    inner.stats.insert(parent, None);
                    inner.stats.insert(target, None);
                    Ok(None)
                }
                Err(e) => {
                    debug!(dir = %parent, error = %e, "listing failed, falling back to stat");
                    self.stat_direct(&target).await
                }
            },
        }
    }

    async fn stat_direct(&self, target: &str) -> Result<Option<RemoteEntry>, StoreError> {
        let entry = self.store.stat(target).await?;
        let mut inner = self.inner.lock().unwrap();
        inner.invalidated.remove(target);
        inner.stats.insert(target.to_string(), entry.clone());
        Ok(entry)
    }

    /// True if `target` exists. Lookup errors count as absent.
    pub async fn exists(&self, target: &str) -> bool {
        self.stat_or_log(target).await.is_some()
    }

    pub async fn exists_file(&self, target: &str) -> bool {
        self.stat_or_log(target).await.is_some_and(|e| e.is_file())
    }

    pub async fn exists_dir(&self, target: &str) -> bool {
        self.stat_or_log(target).await.is_some_and(|e| e.is_dir())
    }

    async fn stat_or_log(&self, target: &str) -> Option<RemoteEntry> {
        match self.stat(target).await {
            Ok(entry) => entry,
            Err(e) => {
                debug!(path = %target, error = %e, "stat failed");
                None
            }
        }
    }

    /// Drops everything cached for `target` and below it, and removes it
    /// from its parent's cached listing. Nothing is refetched.
    pub fn invalidate(&self, target: &str) {
        let target = path::clean(target);
        let prefix = if target == "/" {
            "/".to_string()
        } else {
            format!("{target}/")
        };
        let parent = path::parent(&target);

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.stats.remove(&target);
        inner.listings.remove(&target);
        inner.stats.retain(|k, _| !k.starts_with(&prefix));
        inner.listings.retain(|k, _| !k.starts_with(&prefix));
        inner.invalidated.retain(|k| !k.starts_with(&prefix));

        if parent != target
            && let Some(listing) = inner.listings.get_mut(&parent)
        {
            listing.retain(|e| e.path != target);
            inner.invalidated.insert(target.clone());
        }
        // A parent recorded as missing may exist now.
        if matches!(inner.stats.get(&parent), Some(None)) {
            inner.stats.remove(&parent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalStore;
    use crate::remote::StoreFuture;
    use crate::types::{ArchiveKind, ByteProgressFn, UploadOptions};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Counts metadata calls and can make listings fail.
    struct CountingStore {
        inner: LocalStore,
        stats: AtomicUsize,
        lists: AtomicUsize,
        fail_list: bool,
    }

    impl CountingStore {
        fn new(tmp: &TempDir, fail_list: bool) -> Self {
            Self {
                inner: LocalStore::new(tmp.path()).unwrap(),
                stats: AtomicUsize::new(0),
                lists: AtomicUsize::new(0),
                fail_list,
            }
        }
    }

    impl RemoteStore for CountingStore {
        fn make_dir<'a>(&'a self, path: &'a str, recursive: bool) -> StoreFuture<'a, ()> {
            self.inner.make_dir(path, recursive)
        }

        fn stat<'a>(&'a self, path: &'a str) -> StoreFuture<'a, Option<RemoteEntry>> {
            self.stats.fetch_add(1, Ordering::SeqCst);
            self.inner.stat(path)
        }

        fn list<'a>(&'a self, path: &'a str) -> StoreFuture<'a, Vec<RemoteEntry>> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if self.fail_list {
                return Box::pin(async { Err(StoreError::Remote("listing denied".into())) });
            }
            self.inner.list(path)
        }

        fn upload_file<'a>(
            &'a self,
            local: &'a Path,
            remote: &'a str,
            options: &'a UploadOptions,
            progress: Option<ByteProgressFn>,
        ) -> StoreFuture<'a, ()> {
            self.inner.upload_file(local, remote, options, progress)
        }

        fn remove_file<'a>(&'a self, path: &'a str, force: bool) -> StoreFuture<'a, ()> {
            self.inner.remove_file(path, force)
        }

        fn remove_dir<'a>(
            &'a self,
            path: &'a str,
            recursive: bool,
            force: bool,
        ) -> StoreFuture<'a, ()> {
            self.inner.remove_dir(path, recursive, force)
        }

        fn extract_archive<'a>(
            &'a self,
            archive: &'a str,
            dest: &'a str,
            kind: ArchiveKind,
            bulk_registration: bool,
        ) -> StoreFuture<'a, ()> {
            self.inner
                .extract_archive(archive, dest, kind, bulk_registration)
        }
    }

    fn seed(tmp: &TempDir) {
        let dir = tmp.path().join("zone/home/alice/data");
        std::fs::create_dir_all(&dir).unwrap();
        for name in ["a.dat", "b.dat", "c.dat"] {
            std::fs::write(dir.join(name), name.as_bytes()).unwrap();
        }
    }

    #[tokio::test]
    async fn deep_paths_share_one_parent_listing() {
        let tmp = TempDir::new().unwrap();
        seed(&tmp);
        let store = Arc::new(CountingStore::new(&tmp, false));
        let cache = MetadataCache::new(store.clone());

        for name in ["a.dat", "b.dat", "c.dat", "missing.dat"] {
            let p = format!("/zone/home/alice/data/{name}");
            let found = cache.stat(&p).await.unwrap();
            assert_eq!(found.is_some(), name != "missing.dat", "{name}");
        }

        assert_eq!(store.lists.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shallow_paths_use_direct_stat() {
        let tmp = TempDir::new().unwrap();
        seed(&tmp);
        let store = Arc::new(CountingStore::new(&tmp, false));
        let cache = MetadataCache::new(store.clone());

        assert!(cache.exists_dir("/zone/home/alice").await);
        assert!(cache.exists_dir("/zone/home/alice").await);
        assert!(!cache.exists_file("/zone/home/alice").await);

        assert_eq!(store.stats.load(Ordering::SeqCst), 1);
        assert_eq!(store.lists.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn listing_failure_falls_back_to_stat() {
        let tmp = TempDir::new().unwrap();
        seed(&tmp);
        let store = Arc::new(CountingStore::new(&tmp, true));
        let cache = MetadataCache::new(store.clone());

        let entry = cache
            .stat("/zone/home/alice/data/a.dat")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entry.size, 5);
        assert_eq!(store.lists.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_parent_answers_children() {
        let tmp = TempDir::new().unwrap();
        seed(&tmp);
        let store = Arc::new(CountingStore::new(&tmp, false));
        let cache = MetadataCache::new(store.clone());

        assert!(!cache.exists("/zone/home/alice/nope/x").await);
        assert!(!cache.exists("/zone/home/alice/nope/y").await);
        assert_eq!(store.lists.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_drops_path_from_parent_listing() {
        let tmp = TempDir::new().unwrap();
        seed(&tmp);
        let store = Arc::new(CountingStore::new(&tmp, false));
        let cache = MetadataCache::new(store.clone());
        let target = "/zone/home/alice/data/new.dat";

        assert!(cache.stat(target).await.unwrap().is_none());

        std::fs::write(tmp.path().join("zone/home/alice/data/new.dat"), b"n").unwrap();
        // Stale until invalidated.
        assert!(cache.stat(target).await.unwrap().is_none());

        cache.invalidate(target);
        assert!(cache.exists_file(target).await);
        // Sibling answers still come from the cached listing.
        assert!(cache.exists_file("/zone/home/alice/data/a.dat").await);
        assert_eq!(store.lists.load(Ordering::SeqCst), 1);
        assert_eq!(store.stats.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_sweeps_descendants() {
        let tmp = TempDir::new().unwrap();
        seed(&tmp);
        let store = Arc::new(CountingStore::new(&tmp, false));
        let cache = MetadataCache::new(store.clone());

        cache.list_dir("/zone/home/alice/data").await.unwrap();
        std::fs::remove_dir_all(tmp.path().join("zone/home/alice/data")).unwrap();
        assert!(cache.exists_file("/zone/home/alice/data/a.dat").await);

        cache.invalidate("/zone/home/alice/data");
        assert!(!cache.exists_file("/zone/home/alice/data/a.dat").await);
        assert!(!cache.exists_dir("/zone/home/alice/data").await);
    }
}
