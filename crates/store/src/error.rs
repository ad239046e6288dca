//! Store error types.

use crate::types::EntryKind;

/// Errors produced by a [`RemoteStore`](crate::RemoteStore).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] bulkput_transfer::TransferError),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("{path} is not a {expected}")]
    WrongKind { path: String, expected: EntryKind },

    #[error("invalid remote path: {0}")]
    InvalidPath(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("remote error: {0}")]
    Remote(String),
}

impl StoreError {
    /// Returns true when the error means the path does not exist.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            Self::Transfer(e) => e.is_not_found(),
            _ => false,
        }
    }
}
