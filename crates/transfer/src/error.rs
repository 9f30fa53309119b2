use bigcopy_fetch::FetchError;
use bigcopy_store::StoreError;
use bigcopy_types::PlanError;

use crate::retry::RetryError;

/// Errors produced by the transfer phase.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid plan: {0}")]
    Plan(#[from] PlanError),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("source error: {0}")]
    Source(#[from] FetchError),

    #[error("part {part}: source unavailable: {source}")]
    SourceUnavailable {
        part: u32,
        #[source]
        source: FetchError,
    },

    #[error("part {part}: upload failed: {source}")]
    PartUploadFailed {
        part: u32,
        #[source]
        source: RetryError<StoreError>,
    },

    #[error("storage request failed: {0}")]
    Exhausted(#[source] RetryError<StoreError>),

    #[error("source size changed during transfer: recorded {expected} bytes, now {actual}")]
    SizeChangedDuringTransfer { expected: u64, actual: u64 },

    #[error("source modified since transfer began: recorded {recorded}, now {current}")]
    SourceModified { recorded: String, current: String },

    #[error("checkpoint fingerprint mismatch: expected {expected}, found {found}")]
    FingerprintMismatch { expected: String, found: String },

    #[error("size mismatch after completion: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("transfer cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Task(String),
}

impl TransferError {
    /// Wraps a storage retry failure that is not tied to one part.
    pub(crate) fn from_retry(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Cancelled => Self::Cancelled,
            other => Self::Exhausted(other),
        }
    }
}
