//! Local-side transfer primitives shared by the bundle pipeline.
//!
//! Checksums, byte-range file I/O, tar bundle creation/unpacking, and
//! progress reporting.

mod archive;
mod checksum;
mod chunked;
mod progress;

pub use archive::{ArchiveCallback, create_archive, parent_dirs, unpack_archive};
pub use checksum::{calculate_file_checksum, checksum_bytes, checksum_strings};
pub use chunked::{Chunk, RangeReader, RangeWriter, resolve_relative};
pub use progress::{
    NoopProgress, ProgressCallback, ProgressSink, ProgressSnapshot, ProgressTracker, ProgressUnit,
};

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum mismatch")]
    ChecksumMismatch,

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("source file not found: {}", .0.display())]
    SourceMissing(std::path::PathBuf),
}

impl TransferError {
    /// Returns true when a local source or target does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::SourceMissing(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
