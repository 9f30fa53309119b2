/// Errors produced while reading from a source.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} for {range}")]
    Status { status: u16, range: String },

    #[error("short read: expected {expected} bytes, got {actual}")]
    ShortRead { expected: u64, actual: u64 },

    #[error("source size changed: expected {expected} bytes, source reports {actual}")]
    SizeChanged { expected: u64, actual: u64 },

    #[error("source did not report its size")]
    MissingLength,

    #[error("invalid range: {0}")]
    InvalidRange(String),

    #[error("fetcher closed")]
    Closed,
}

impl FetchError {
    /// Whether the failure is a connectivity or server hiccup rather than a
    /// property of the source.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Io(_) | Self::Http(_) | Self::ShortRead { .. } => true,
            Self::Status { status, .. } => *status >= 500,
            _ => false,
        }
    }
}
