use std::sync::Arc;

/// Error type returned by job bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Errors reported by the [`ParallelJobScheduler`](crate::ParallelJobScheduler).
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobError {
    #[error("job {name} failed: {source}")]
    Failed {
        name: String,
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    #[error("job {0} panicked")]
    Panicked(String),

    #[error("scheduling is already done")]
    Closed,

    #[error("scheduler was canceled")]
    Canceled,
}
