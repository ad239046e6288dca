//! Partitions scheduled entries into bundles.

use std::path::{Component, Path};
use std::sync::Arc;
use std::time::SystemTime;

use bulkput_store::{EntryKind, path};
use bulkput_transfer::calculate_file_checksum;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use crate::bundle::{Bundle, Entry, OpenBundle};
use crate::error::BundleError;
use crate::manager::RunState;

/// Outcome of one `schedule` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduled {
    /// Appended to the bundle with this index.
    Added { bundle: u64 },
    /// Already present and unchanged at the destination.
    Skipped,
}

struct AssemblerState {
    open: Option<OpenBundle>,
    next_index: u64,
    /// `None` once scheduling is done.
    input: Option<mpsc::Sender<Arc<Bundle>>>,
}

/// Single-writer bundle builder feeding the pipeline input queue.
pub(crate) struct Assembler {
    run: Arc<RunState>,
    state: Mutex<AssemblerState>,
}

/// Re-roots `local` from `local_root` onto `dest`.
pub(crate) fn target_path(local_root: &Path, dest: &str, local: &Path) -> Result<String, BundleError> {
    let outside = || BundleError::OutsideRoot {
        path: local.to_path_buf(),
        root: local_root.to_path_buf(),
    };
    let rel = local.strip_prefix(local_root).map_err(|_| outside())?;

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(outside()),
        }
    }
    Ok(path::join(dest, &parts.join("/")))
}

impl Assembler {
    pub(crate) fn new(run: Arc<RunState>, input: mpsc::Sender<Arc<Bundle>>) -> Self {
        Self {
            run,
            state: Mutex::new(AssemblerState {
                open: None,
                next_index: 0,
                input: Some(input),
            }),
        }
    }

    pub(crate) async fn schedule(
        &self,
        local: &Path,
        is_dir: bool,
        size: i64,
        mod_time: Option<SystemTime>,
    ) -> Result<Scheduled, BundleError> {
        let mut state = self.state.lock().await;
        // Under the lock: once the run is latched no entry is added.
        if let Some(failure) = self.run.latched() {
            return Err(failure.into());
        }
        let config = &self.run.config;
        let target = target_path(&config.local_root, &self.run.dest, local)?;
        let size = if is_dir { 0 } else { size };

        if state.input.is_none() {
            return Err(BundleError::PipelineClosed);
        }

        let needs_new = match &state.open {
            Some(open) => open.is_full(config.max_bundle_count, config.max_bundle_size),
            None => true,
        };
        if needs_new {
            if let Some(full) = state.open.take() {
                self.seal_and_send(&state, full).await?;
            }
            let index = state.next_index;
            state.next_index += 1;
            state.open = Some(OpenBundle::new(index));
            debug!(bundle = index, "opened bundle");
        }

        if config.different_files_only && self.is_unchanged(local, &target, is_dir, size).await? {
            debug!(path = %local.display(), target = %target, "unchanged at destination, skipping");
            return Ok(Scheduled::Skipped);
        }

        let Some(open) = state.open.as_mut() else {
            return Err(BundleError::PipelineClosed);
        };
        let index = open.index();
        open.push(Entry {
            local_path: local.to_path_buf(),
            remote_path: target.clone(),
            size,
            kind: if is_dir { EntryKind::Dir } else { EntryKind::File },
            mod_time,
        });
        self.run.record_target(target);
        Ok(Scheduled::Added { bundle: index })
    }

    /// Seals the open bundle and closes the input queue.
    pub(crate) async fn done_scheduling(&self) -> Result<(), BundleError> {
        let mut state = self.state.lock().await;
        if state.input.is_none() {
            warn!("done_scheduling called more than once");
            return Ok(());
        }
        if let Some(open) = state.open.take() {
            self.seal_and_send(&state, open).await?;
        }
        state.input = None;
        debug!(bundles = state.next_index, "scheduling done");
        Ok(())
    }

    pub(crate) async fn is_open(&self) -> bool {
        self.state.lock().await.input.is_some()
    }

    async fn seal_and_send(&self, state: &AssemblerState, open: OpenBundle) -> Result<(), BundleError> {
        let config = &self.run.config;
        let bundle = Arc::new(open.seal(
            config.min_archive_count,
            &config.local_temp_dir,
            &self.run.staging,
        ));
        debug!(
            bundle = bundle.index(),
            entries = bundle.entries().len(),
            size = bundle.size(),
            archive = bundle.require_archive(),
            "sealed bundle"
        );

        let Some(input) = state.input.as_ref() else {
            return Err(BundleError::PipelineClosed);
        };
        self.run.register(Arc::clone(&bundle));
        input
            .send(bundle)
            .await
            .map_err(|_| BundleError::PipelineClosed)
    }

    /// Difference-mode check against the destination.
    async fn is_unchanged(
        &self,
        local: &Path,
        target: &str,
        is_dir: bool,
        size: i64,
    ) -> Result<bool, BundleError> {
        let Some(remote) = self.run.cache.stat(target).await? else {
            return Ok(false);
        };
        if is_dir {
            return Ok(remote.is_dir());
        }
        if !remote.is_file() || remote.size != size {
            return Ok(false);
        }
        if self.run.config.no_hash {
            return Ok(true);
        }
        let Some(remote_sum) = remote.checksum else {
            return Ok(false);
        };

        let local = local.to_path_buf();
        let local_sum = tokio::task::spawn_blocking(move || calculate_file_checksum(&local)).await??;
        Ok(local_sum.eq_ignore_ascii_case(&remote_sum))
    }
}
