//! Bundled bulk upload into a remote store.
//!
//! Scheduled files are grouped into size/count-bounded bundles. Each bundle
//! flows through a concurrent pipeline:
//!
//! ```text
//! intake --> archive --> upload ------------------> join --> extract
//!        \-> pre-clean ------------------------------^
//! ```
//!
//! Small bundles skip the archive and extract steps and upload their
//! members one by one. The first failure in any stage latches the run;
//! later work is skipped but every bundle still reaches the join so
//! [`TransferManager::wait`] always returns.

mod assembler;
mod bundle;
mod config;
mod error;
mod manager;
pub mod report;
mod stages;
pub mod staging;

pub use assembler::Scheduled;
pub use bundle::{Bundle, Entry, bundle_archive_name};
pub use config::{
    BundleConfig, MAX_BUNDLE_COUNT_DEFAULT, MAX_BUNDLE_SIZE_DEFAULT, MIN_ARCHIVE_COUNT_DEFAULT,
    TransferMode, UPLOAD_THREADS_DEFAULT, UPLOAD_THREADS_MAX,
};
pub use error::{BundleError, Stage, StageFailure};
pub use manager::{RunCounters, TransferManager};
pub use report::{
    JsonLinesReporter, NoopReporter, TransferMethod, TransferRecord, TransferReporter,
};
