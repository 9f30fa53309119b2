//! Copy error types.

use bigcopy_merge::MergeError;
use bigcopy_transfer::TransferError;

/// Errors produced by a resumable copy.
#[derive(Debug, thiserror::Error)]
pub enum CopyError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("transfer error: {0}")]
    Transfer(#[source] TransferError),

    #[error("merge error: {0}")]
    Merge(#[source] MergeError),

    #[error("cancelled")]
    Cancelled,
}

impl From<TransferError> for CopyError {
    fn from(err: TransferError) -> Self {
        match err {
            TransferError::Cancelled => Self::Cancelled,
            TransferError::Config(msg) => Self::Config(msg),
            other => Self::Transfer(other),
        }
    }
}

impl From<MergeError> for CopyError {
    fn from(err: MergeError) -> Self {
        match err {
            MergeError::Cancelled | MergeError::Transfer(TransferError::Cancelled) => {
                Self::Cancelled
            }
            MergeError::Config(msg) => Self::Config(msg),
            other => Self::Merge(other),
        }
    }
}
