//! Staging directory policy and leftover bundle cleanup.

use std::path::Path;

use bulkput_store::{RemoteStore, path};
use tracing::{debug, info, warn};

use crate::error::BundleError;

/// Name of the default staging directory inside the destination.
pub const STAGING_DIR_NAME: &str = ".bulkput_staging";

/// Depth of the store's top-level namespace (`/zone/home/user`). Staging
/// directories must live strictly below it.
pub const TOP_NAMESPACE_DEPTH: usize = 3;

const BUNDLE_PREFIX: &str = "bundle_";
const BUNDLE_SUFFIX: &str = ".tar";

/// Default staging directory for `dest`.
pub fn default_staging_dir(dest: &str) -> String {
    path::join(dest, STAGING_DIR_NAME)
}

/// True if `dir` is a default in-destination staging directory.
pub fn is_default_staging_dir(dir: &str) -> bool {
    path::file_name(dir) == STAGING_DIR_NAME
}

/// Rejects staging directories that are relative, contain `..`, or sit at
/// or above the top-level namespace.
pub fn check_staging_dir(dir: &str) -> Result<(), BundleError> {
    if !path::is_absolute(dir) {
        return Err(BundleError::UnsafeStaging(format!("{dir} is not absolute")));
    }
    if dir.split('/').any(|c| c == "..") {
        return Err(BundleError::UnsafeStaging(format!("{dir} contains '..'")));
    }
    if path::depth(dir) <= TOP_NAMESPACE_DEPTH {
        return Err(BundleError::UnsafeStaging(format!(
            "{dir} is too close to the namespace root"
        )));
    }
    Ok(())
}

/// Archive file name for a bundle whose identity hash is `hash`.
pub fn bundle_filename(hash: &str) -> String {
    format!("{BUNDLE_PREFIX}{hash}{BUNDLE_SUFFIX}")
}

/// True for names produced by [`bundle_filename`] with a SHA-256 hex hash.
pub fn is_bundle_filename(name: &str) -> bool {
    name.strip_prefix(BUNDLE_PREFIX)
        .and_then(|rest| rest.strip_suffix(BUNDLE_SUFFIX))
        .is_some_and(|hash| hash.len() == 64 && hash.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Deletes leftover bundle archives from a local temp directory.
///
/// Returns how many files were removed. A missing directory counts as empty.
pub fn clean_up_local_bundles(temp_dir: &Path) -> Result<usize, BundleError> {
    let read = match std::fs::read_dir(temp_dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    for item in read {
        let item = item?;
        let name = item.file_name();
        if !item.file_type()?.is_file() || !is_bundle_filename(&name.to_string_lossy()) {
            continue;
        }
        debug!(path = %item.path().display(), "removing local bundle file");
        match std::fs::remove_file(item.path()) {
            Ok(()) => removed += 1,
            Err(e) => warn!(path = %item.path().display(), error = %e, "failed to remove local bundle file"),
        }
    }
    if removed > 0 {
        info!(dir = %temp_dir.display(), removed, "cleaned up local bundle files");
    }
    Ok(removed)
}

/// Deletes leftover bundle archives from a remote staging directory, and the
/// directory itself when `remove_dir` is set and nothing else is left in it.
///
/// Returns how many archives were removed. A missing directory counts as empty.
pub async fn clean_up_remote_bundles(
    store: &dyn RemoteStore,
    staging_dir: &str,
    remove_dir: bool,
) -> Result<usize, BundleError> {
    check_staging_dir(staging_dir)?;

    let entries = match store.list(staging_dir).await {
        Ok(entries) => entries,
        Err(e) if e.is_not_found() => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    let mut removed = 0;
    let mut remaining = 0;
    for entry in entries {
        if !entry.is_file() || !is_bundle_filename(&entry.name) {
            remaining += 1;
            continue;
        }
        debug!(path = %entry.path, "removing staged bundle file");
        match store.remove_file(&entry.path, true).await {
            Ok(()) => removed += 1,
            Err(e) => {
                remaining += 1;
                warn!(path = %entry.path, error = %e, "failed to remove staged bundle file");
            }
        }
    }

    if remove_dir && remaining == 0 {
        store.remove_dir(staging_dir, true, true).await?;
        debug!(dir = %staging_dir, "removed staging directory");
    }
    if removed > 0 {
        info!(dir = %staging_dir, removed, "cleaned up staged bundle files");
    }
    Ok(removed)
}
