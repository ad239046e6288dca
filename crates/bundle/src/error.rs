//! Bundle pipeline error types.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use bulkput_store::StoreError;
use bulkput_transfer::TransferError;

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Intake,
    Archive,
    Upload,
    PreClean,
    Extract,
}

impl Stage {
    /// Task label used in progress names.
    pub fn task_name(self) -> &'static str {
        match self {
            Self::Intake => "Preparing",
            Self::Archive => "Bundling",
            Self::Upload => "Uploading",
            Self::PreClean => "Cleaning & making dirs",
            Self::Extract => "Extracting",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Intake => "intake",
            Self::Archive => "archive",
            Self::Upload => "upload",
            Self::PreClean => "pre-clean",
            Self::Extract => "extract",
        })
    }
}

/// The first failure of a run, as returned by `schedule` and `wait`.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bundle {bundle} failed in {stage} stage: {source}")]
pub struct StageFailure {
    pub stage: Stage,
    pub bundle: u64,
    pub source: Arc<BundleError>,
}

/// Errors produced by the bundle pipeline.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("{} is not under local root {}", path.display(), root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("checksum mismatch for {path}: local {local}, remote {remote}")]
    ChecksumMismatch {
        path: String,
        local: String,
        remote: String,
    },

    #[error("store reports no checksum for {0}")]
    ChecksumUnavailable(String),

    #[error("transfer report error: {0}")]
    Report(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("unsafe staging directory: {0}")]
    UnsafeStaging(String),

    #[error(transparent)]
    Stage(#[from] StageFailure),

    #[error("only {done} of {scheduled} bundles completed")]
    Incomplete { done: u64, scheduled: u64 },

    #[error("scheduling is already done")]
    PipelineClosed,

    #[error("task join error: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for BundleError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Join(e.to_string())
    }
}
