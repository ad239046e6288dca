//! Run state and the public transfer manager.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use bulkput_store::{MetadataCache, RemoteStore};
use bulkput_transfer::{ProgressSink, ProgressUnit};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::assembler::{self, Assembler, Scheduled};
use crate::bundle::Bundle;
use crate::config::BundleConfig;
use crate::error::{BundleError, Stage, StageFailure};
use crate::report::{NoopReporter, TransferReporter};
use crate::stages;

/// Sealed bundles waiting for the intake stage.
const INPUT_QUEUE_DEPTH: usize = 100;

/// State shared by the assembler and every stage for one run.
pub(crate) struct RunState {
    pub(crate) config: BundleConfig,
    /// Cleaned remote destination.
    pub(crate) dest: String,
    pub(crate) staging: String,
    pub(crate) cache: Arc<MetadataCache>,
    pub(crate) progress: Arc<dyn ProgressSink>,
    pub(crate) reporter: Arc<dyn TransferReporter>,
    latch: Mutex<Option<StageFailure>>,
    scheduled: AtomicU64,
    done: AtomicU64,
    bundles: Mutex<Vec<Arc<Bundle>>>,
    targets: Mutex<Vec<String>>,
}

impl RunState {
    pub(crate) fn store(&self) -> &dyn RemoteStore {
        self.cache.store().as_ref()
    }

    pub(crate) fn latched(&self) -> Option<StageFailure> {
        self.latch.lock().unwrap().clone()
    }

    pub(crate) fn is_failed(&self) -> bool {
        self.latch.lock().unwrap().is_some()
    }

    /// Tags `bundle` with the failure and latches the run if nothing else
    /// has yet.
    pub(crate) fn fail(&self, stage: Stage, bundle: &Bundle, err: BundleError) {
        let err = Arc::new(err);
        bundle.record_failure(stage, Arc::clone(&err));
        error!(bundle = bundle.index(), stage = %stage, error = %err, "bundle failed");

        let mut latch = self.latch.lock().unwrap();
        if latch.is_none() {
            *latch = Some(StageFailure {
                stage,
                bundle: bundle.index(),
                source: err,
            });
        }
    }

    pub(crate) fn register(&self, bundle: Arc<Bundle>) {
        self.bundles.lock().unwrap().push(bundle);
        self.scheduled.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn mark_done(&self, bundle: &Bundle) {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(bundle = bundle.index(), done, "bundle complete");
    }

    pub(crate) fn record_target(&self, target: String) {
        self.targets.lock().unwrap().push(target);
    }

    /// Reports progress for one bundle stage as `bundle {i} - {task}`.
    pub(crate) fn report(
        &self,
        bundle: &Bundle,
        stage: Stage,
        processed: i64,
        total: i64,
        unit: ProgressUnit,
        errored: bool,
    ) {
        let name = progress_name(bundle.index(), stage);
        self.progress.progress(&name, processed, total, unit, errored);
    }
}

pub(crate) fn progress_name(index: u64, stage: Stage) -> String {
    format!("bundle {index} - {}", stage.task_name())
}

/// Bundle counts for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounters {
    pub scheduled: u64,
    pub done: u64,
}

/// Drives one bundled upload run.
///
/// Call [`schedule`](Self::schedule) for each file or directory, then
/// [`done_scheduling`](Self::done_scheduling), then [`wait`](Self::wait).
pub struct TransferManager {
    run: Arc<RunState>,
    assembler: Assembler,
    tasks: Mutex<JoinSet<()>>,
}

impl TransferManager {
    /// Validates `config` and starts the pipeline stages.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        config: BundleConfig,
        cache: Arc<MetadataCache>,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<Self, BundleError> {
        Self::start_with_reporter(config, cache, progress, Arc::new(NoopReporter))
    }

    /// Like [`start`](Self::start), sending a record for every landed entry
    /// to `reporter`.
    pub fn start_with_reporter(
        config: BundleConfig,
        cache: Arc<MetadataCache>,
        progress: Arc<dyn ProgressSink>,
        reporter: Arc<dyn TransferReporter>,
    ) -> Result<Self, BundleError> {
        config.validate()?;

        let run = Arc::new(RunState {
            dest: config.dest_dir(),
            staging: config.staging_dir(),
            config,
            cache,
            progress,
            reporter,
            latch: Mutex::new(None),
            scheduled: AtomicU64::new(0),
            done: AtomicU64::new(0),
            bundles: Mutex::new(Vec::new()),
            targets: Mutex::new(Vec::new()),
        });

        let (input_tx, input_rx) = mpsc::channel(INPUT_QUEUE_DEPTH);
        let tasks = stages::spawn(Arc::clone(&run), input_rx);
        info!(
            dest = %run.dest,
            staging = %run.staging,
            upload_threads = run.config.upload_thread_count(),
            "transfer pipeline started"
        );

        Ok(Self {
            assembler: Assembler::new(Arc::clone(&run), input_tx),
            run,
            tasks: Mutex::new(tasks),
        })
    }

    /// Adds one local file or directory to the run.
    ///
    /// Returns the latched failure once any bundle has failed. Entries
    /// outside the configured local root are rejected without failing the
    /// run.
    pub async fn schedule(
        &self,
        local: &Path,
        is_dir: bool,
        size: i64,
        mod_time: Option<SystemTime>,
    ) -> Result<Scheduled, BundleError> {
        self.assembler.schedule(local, is_dir, size, mod_time).await
    }

    /// Seals the last bundle and closes the input queue. Call once.
    pub async fn done_scheduling(&self) -> Result<(), BundleError> {
        self.assembler.done_scheduling().await
    }

    /// Blocks until every sealed bundle has passed the extract stage.
    ///
    /// Seals and closes scheduling first if that has not happened yet.
    /// Returns the first failure of the run, if any.
    pub async fn wait(&self) -> Result<(), BundleError> {
        if self.assembler.is_open().await {
            self.assembler.done_scheduling().await?;
        }

        let mut tasks = std::mem::take(&mut *self.tasks.lock().unwrap());
        let mut panicked = None;
        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!(error = %e, "pipeline stage panicked");
                panicked.get_or_insert(BundleError::from(e));
            }
        }

        self.clean_up_staging().await;

        let counters = self.counters();
        if let Some(failure) = self.run.latched() {
            warn!(
                scheduled = counters.scheduled,
                done = counters.done,
                error = %failure,
                "transfer run failed"
            );
            return Err(failure.into());
        }
        if let Some(e) = panicked {
            return Err(e);
        }
        if counters.done != counters.scheduled {
            return Err(BundleError::Incomplete {
                done: counters.done,
                scheduled: counters.scheduled,
            });
        }
        info!(bundles = counters.done, "transfer run complete");
        Ok(())
    }

    /// Removes the default staging directory if the run left it empty.
    async fn clean_up_staging(&self) {
        if !self.run.config.uses_default_staging() {
            return;
        }
        let staging = &self.run.staging;
        let store = self.run.store();
        match store.list(staging).await {
            Ok(entries) if entries.is_empty() => {
                match store.remove_dir(staging, false, true).await {
                    Ok(()) => {
                        self.run.cache.invalidate(staging);
                        debug!(dir = %staging, "removed empty staging directory");
                    }
                    Err(e) => warn!(dir = %staging, error = %e, "failed to remove staging directory"),
                }
            }
            Ok(_) => debug!(dir = %staging, "staging directory not empty, keeping it"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(dir = %staging, error = %e, "failed to list staging directory"),
        }
    }

    /// Every bundle sealed so far, in index order.
    pub fn bundles(&self) -> Vec<Arc<Bundle>> {
        self.run.bundles.lock().unwrap().clone()
    }

    /// Remote target of every entry added to a bundle.
    pub fn scheduled_targets(&self) -> Vec<String> {
        self.run.targets.lock().unwrap().clone()
    }

    /// Remote path `local` would be uploaded to.
    pub fn target_path(&self, local: &Path) -> Result<String, BundleError> {
        assembler::target_path(&self.run.config.local_root, &self.run.dest, local)
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters {
            scheduled: self.run.scheduled.load(Ordering::SeqCst),
            done: self.run.done.load(Ordering::SeqCst),
        }
    }

    pub fn staging_dir(&self) -> &str {
        &self.run.staging
    }

    pub fn config(&self) -> &BundleConfig {
        &self.run.config
    }

    /// The first failure of the run, if any.
    pub fn failure(&self) -> Option<StageFailure> {
        self.run.latched()
    }
}
