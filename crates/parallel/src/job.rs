use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use bulkput_transfer::{ProgressSink, ProgressUnit};
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// Future produced by a job body.
pub type JobFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

/// A job body. Called once with its context when admitted.
pub type JobTask = Box<dyn FnOnce(JobContext) -> JobFuture + Send>;

/// Handle given to a running job.
#[derive(Clone)]
pub struct JobContext {
    name: Arc<str>,
    unit: ProgressUnit,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    last_total: Arc<AtomicI64>,
}

impl JobContext {
    pub(crate) fn new(
        name: Arc<str>,
        unit: ProgressUnit,
        sink: Arc<dyn ProgressSink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            unit,
            sink,
            cancel,
            last_total: Arc::new(AtomicI64::new(0)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reports progress under the job's name and unit.
    pub fn progress(&self, processed: i64, total: i64) {
        self.last_total.store(total, Ordering::Relaxed);
        self.sink
            .progress(&self.name, processed, total, self.unit, false);
    }

    /// Marks the job's progress as failed.
    pub(crate) fn progress_failed(&self) {
        let total = self.last_total.load(Ordering::Relaxed);
        self.sink.progress(&self.name, -1, total, self.unit, true);
    }

    /// True once the scheduler was canceled or another job failed.
    pub fn is_canceled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the scheduler is canceled.
    pub async fn canceled(&self) {
        self.cancel.cancelled().await
    }
}
