use bigcopy_store::StoreError;
use bigcopy_transfer::{RetryError, TransferError};

/// Errors produced by the merge phase.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no manifest in {0}")]
    ManifestMissing(String),

    #[error("transfer incomplete: {count} parts missing ({remaining})")]
    TransferIncomplete { count: usize, remaining: String },

    #[error("part {part}: copy failed: {source}")]
    CopyPartFailed {
        part: u32,
        #[source]
        source: RetryError<StoreError>,
    },

    #[error("completing the upload failed: {0}")]
    CompleteFailed(#[source] RetryError<StoreError>),

    #[error("storage request failed: {0}")]
    Exhausted(#[source] RetryError<StoreError>),

    #[error("merged object is {actual} bytes, expected {expected}; parts kept")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("merged object {0} does not exist; parts kept")]
    DestinationMissing(String),

    #[error("merge state writer failed: {0}")]
    StateWriter(String),

    #[error("merge cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Task(String),
}

impl MergeError {
    pub(crate) fn from_retry(err: RetryError<StoreError>) -> Self {
        match err {
            RetryError::Cancelled => Self::Cancelled,
            other => Self::Exhausted(other),
        }
    }
}
