/// Errors returned by object-storage operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("no such multipart upload: {0}")]
    NoSuchUpload(String),

    #[error("invalid part list: {0}")]
    InvalidPart(String),

    #[error("part {part_number} is {size} bytes, below the minimum part size")]
    EntityTooSmall { part_number: u32, size: u64 },

    #[error("transient storage error: {0}")]
    Transient(String),

    #[error("storage service error: {0}")]
    Service(String),
}

impl StoreError {
    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        Self::Transient(err.to_string())
    }
}
