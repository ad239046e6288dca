//! Weighted admission control over a FIFO job queue.
//!
//! One dispatcher task drains the queue in submission order. Before starting
//! a job it acquires `weight` permits from a semaphore sized to the thread
//! budget, so a heavy job at the head of the queue holds back later ones
//! until enough running jobs finish. Completion order is unconstrained.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bulkput_transfer::{ProgressSink, ProgressUnit};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::error::{BoxError, JobError};
use crate::job::{JobContext, JobTask};

/// Job outcome counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobCounters {
    pub scheduled: u64,
    pub done: u64,
    pub errored: u64,
    pub canceled: u64,
}

struct Job {
    id: u64,
    name: Arc<str>,
    weight: usize,
    unit: ProgressUnit,
    task: JobTask,
}

struct Shared {
    latch: Mutex<Option<JobError>>,
    counters: Mutex<JobCounters>,
    cancel: CancellationToken,
    sink: Arc<dyn ProgressSink>,
}

impl Shared {
    fn latched(&self) -> Option<JobError> {
        self.latch.lock().unwrap().clone()
    }

    fn set_latch(&self, err: JobError) {
        let mut latch = self.latch.lock().unwrap();
        if latch.is_none() {
            error!(error = %err, "job failed, stopping new jobs");
            *latch = Some(err);
            self.cancel.cancel();
        }
    }

    fn skip(&self, job: &Job) {
        debug!(job = %job.name, id = job.id, "skipping job");
        self.counters.lock().unwrap().canceled += 1;
    }

    fn finish(&self, ctx: &JobContext, outcome: Result<Result<(), BoxError>, tokio::task::JoinError>) {
        match outcome {
            Ok(Ok(())) => {
                self.counters.lock().unwrap().done += 1;
            }
            Ok(Err(e)) => {
                self.counters.lock().unwrap().errored += 1;
                ctx.progress_failed();
                self.set_latch(JobError::Failed {
                    name: ctx.name().to_string(),
                    source: Arc::from(e),
                });
            }
            Err(e) => {
                self.counters.lock().unwrap().errored += 1;
                ctx.progress_failed();
                let err = if e.is_panic() {
                    JobError::Panicked(ctx.name().to_string())
                } else {
                    JobError::Canceled
                };
                self.set_latch(err);
            }
        }
    }
}

/// Runs jobs concurrently under a total thread-weight budget.
pub struct ParallelJobScheduler {
    max_threads: usize,
    next_id: AtomicU64,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    dispatcher: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    shared: Arc<Shared>,
}

impl ParallelJobScheduler {
    /// Starts the dispatcher. Must be called inside a tokio runtime.
    ///
    /// `max_threads` is clamped to at least 1.
    pub fn new(max_threads: usize, sink: Arc<dyn ProgressSink>) -> Self {
        let max_threads = max_threads.max(1);
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            latch: Mutex::new(None),
            counters: Mutex::new(JobCounters::default()),
            cancel: CancellationToken::new(),
            sink,
        });
        let handle = tokio::spawn(dispatch(rx, max_threads, Arc::clone(&shared)));
        Self {
            max_threads,
            next_id: AtomicU64::new(0),
            tx: Mutex::new(Some(tx)),
            dispatcher: tokio::sync::Mutex::new(Some(handle)),
            shared,
        }
    }

    pub fn max_threads(&self) -> usize {
        self.max_threads
    }

    /// Queues a job needing `weight` threads.
    ///
    /// Returns the latched error once any job has failed, and
    /// [`JobError::Closed`] after [`done_scheduling`](Self::done_scheduling).
    /// A weight above the budget is clamped to the budget.
    pub fn schedule<F>(
        &self,
        name: impl Into<String>,
        weight: usize,
        unit: ProgressUnit,
        task: F,
    ) -> Result<(), JobError>
    where
        F: FnOnce(JobContext) -> crate::job::JobFuture + Send + 'static,
    {
        if let Some(err) = self.shared.latched() {
            return Err(err);
        }
        let tx = self.tx.lock().unwrap();
        let Some(tx) = tx.as_ref() else {
            return Err(JobError::Closed);
        };

        let name: Arc<str> = Arc::from(name.into());
        let job = Job {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            name: Arc::clone(&name),
            weight,
            unit,
            task: Box::new(task),
        };
        tx.send(job).map_err(|_| JobError::Closed)?;
        self.shared.counters.lock().unwrap().scheduled += 1;
        debug!(job = %name, weight, "job scheduled");
        Ok(())
    }

    /// Closes the queue. Later `schedule` calls fail with [`JobError::Closed`].
    pub fn done_scheduling(&self) {
        self.tx.lock().unwrap().take();
    }

    /// Stops admitting jobs and signals running ones through
    /// [`JobContext::is_canceled`].
    pub fn cancel(&self) {
        self.shared.cancel.cancel();
    }

    pub fn counters(&self) -> JobCounters {
        *self.shared.counters.lock().unwrap()
    }

    /// Waits for every queued job to finish or be skipped.
    ///
    /// [`done_scheduling`](Self::done_scheduling) must have been called,
    /// otherwise this never returns. Returns the first job error.
    pub async fn wait(&self) -> Result<(), JobError> {
        let handle = self.dispatcher.lock().await.take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            self.shared.set_latch(JobError::Panicked(format!("dispatcher: {e}")));
        }

        let counters = self.counters();
        info!(
            scheduled = counters.scheduled,
            done = counters.done,
            errored = counters.errored,
            canceled = counters.canceled,
            "parallel jobs finished"
        );

        match self.shared.latched() {
            Some(err) => Err(err),
            None if counters.canceled > 0 => Err(JobError::Canceled),
            None => Ok(()),
        }
    }
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<Job>, max_threads: usize, shared: Arc<Shared>) {
    let semaphore = Arc::new(Semaphore::new(max_threads));
    let mut running = JoinSet::new();

    while let Some(job) = rx.recv().await {
        while running.try_join_next().is_some() {}

        if shared.latched().is_some() || shared.cancel.is_cancelled() {
            shared.skip(&job);
            continue;
        }

        let weight = job.weight.clamp(1, max_threads) as u32;
        let permit = tokio::select! {
            permit = Arc::clone(&semaphore).acquire_many_owned(weight) => permit,
            _ = shared.cancel.cancelled() => {
                shared.skip(&job);
                continue;
            }
        };
        let Ok(permit) = permit else {
            shared.skip(&job);
            continue;
        };
        // A job may have failed while this one waited for budget.
        if shared.latched().is_some() {
            shared.skip(&job);
            continue;
        }

        debug!(job = %job.name, id = job.id, weight, "job started");
        let ctx = JobContext::new(
            Arc::clone(&job.name),
            job.unit,
            Arc::clone(&shared.sink),
            shared.cancel.clone(),
        );
        let shared = Arc::clone(&shared);
        let task = job.task;
        running.spawn(async move {
            let _permit = permit;
            let outcome = tokio::spawn(task(ctx.clone())).await;
            shared.finish(&ctx, outcome);
        });
    }

    while running.join_next().await.is_some() {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use bulkput_transfer::{NoopProgress, ProgressTracker};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn scheduler(max: usize) -> ParallelJobScheduler {
        ParallelJobScheduler::new(max, Arc::new(NoopProgress))
    }

    /// Job that records the peak concurrent weight.
    fn weighted_job(
        weight: usize,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    ) -> impl FnOnce(JobContext) -> crate::job::JobFuture + Send + 'static {
        move |_ctx| -> crate::job::JobFuture {
            Box::pin(async move {
                let now = current.fetch_add(weight, Ordering::SeqCst) + weight;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                current.fetch_sub(weight, Ordering::SeqCst);
                Ok(())
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn weight_budget_is_never_exceeded() {
        let sched = scheduler(4);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for (i, weight) in [3, 2, 1, 4, 1, 2, 3, 1].into_iter().enumerate() {
            sched
                .schedule(
                    format!("job {i}"),
                    weight,
                    ProgressUnit::Bytes,
                    weighted_job(weight, Arc::clone(&current), Arc::clone(&peak)),
                )
                .unwrap();
        }
        sched.done_scheduling();
        sched.wait().await.unwrap();

        assert!(peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(sched.counters().done, 8);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn light_jobs_run_together() {
        let sched = scheduler(4);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            sched
                .schedule(
                    format!("job {i}"),
                    1,
                    ProgressUnit::Count,
                    weighted_job(1, Arc::clone(&current), Arc::clone(&peak)),
                )
                .unwrap();
        }
        sched.done_scheduling();
        sched.wait().await.unwrap();
        assert!(peak.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn oversized_weight_is_clamped() {
        let sched = scheduler(2);
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        sched
            .schedule("huge", 64, ProgressUnit::Bytes, move |_ctx| {
                Box::pin(async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .unwrap();
        sched.done_scheduling();
        tokio::time::timeout(Duration::from_secs(5), sched.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_latches_and_skips_later_jobs() {
        let sched = scheduler(1);
        sched
            .schedule("bad", 1, ProgressUnit::Bytes, |_ctx| {
                Box::pin(async { Err::<(), BoxError>("disk full".into()) })
            })
            .unwrap();

        let ran = Arc::new(AtomicUsize::new(0));
        for i in 0..3 {
            let r = Arc::clone(&ran);
            // Scheduling may already be rejected once the failure is latched.
            let _ = sched.schedule(format!("later {i}"), 1, ProgressUnit::Bytes, move |_ctx| {
                Box::pin(async move {
                    r.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
        }
        sched.done_scheduling();

        let err = sched.wait().await.unwrap_err();
        assert!(matches!(&err, JobError::Failed { name, .. } if name == "bad"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        let counters = sched.counters();
        assert_eq!(counters.errored, 1);
        assert_eq!(counters.done, 0);
        assert_eq!(counters.scheduled, counters.errored + counters.canceled);

        let rejected = sched.schedule("after", 1, ProgressUnit::Bytes, |_ctx| {
            Box::pin(async { Ok(()) })
        });
        assert!(matches!(rejected, Err(JobError::Failed { .. })));
    }

    #[tokio::test]
    async fn panicking_job_is_reported() {
        let sched = scheduler(2);
        sched
            .schedule("boom", 1, ProgressUnit::Count, |_ctx| {
                Box::pin(async {
                    if true {
                        panic!("job blew up");
                    }
                    Ok(())
                })
            })
            .unwrap();
        sched.done_scheduling();
        let err = sched.wait().await.unwrap_err();
        assert!(matches!(err, JobError::Panicked(name) if name == "boom"));
    }

    #[tokio::test]
    async fn schedule_after_done_is_rejected() {
        let sched = scheduler(2);
        sched.done_scheduling();
        let result = sched.schedule("late", 1, ProgressUnit::Count, |_ctx| {
            Box::pin(async { Ok(()) })
        });
        assert!(matches!(result, Err(JobError::Closed)));
        sched.wait().await.unwrap();
    }

    #[tokio::test]
    async fn cancel_signals_running_jobs() {
        let sched = Arc::new(scheduler(2));
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();
        sched
            .schedule("long", 1, ProgressUnit::Bytes, move |ctx| {
                Box::pin(async move {
                    let _ = started_tx.send(());
                    ctx.canceled().await;
                    assert!(ctx.is_canceled());
                    Ok(())
                })
            })
            .unwrap();
        sched.done_scheduling();

        started_rx.await.unwrap();
        sched.cancel();
        tokio::time::timeout(Duration::from_secs(5), sched.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(sched.counters().done, 1);
    }

    #[tokio::test]
    async fn job_progress_reaches_sink() {
        let tracker = Arc::new(ProgressTracker::new(None));
        let sched = ParallelJobScheduler::new(2, tracker.clone());
        sched
            .schedule("upload big.dat", 1, ProgressUnit::Bytes, |ctx| {
                Box::pin(async move {
                    ctx.progress(0, 100);
                    ctx.progress(100, 100);
                    Ok(())
                })
            })
            .unwrap();
        sched.done_scheduling();
        sched.wait().await.unwrap();

        let snap = tracker.snapshot("upload big.dat").unwrap();
        assert!(snap.done);
        assert_eq!(snap.processed, 100);
    }
}
