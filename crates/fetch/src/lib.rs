//! Chunk fetchers: read one byte range of a source at a time.
//!
//! A fetcher owns its own in-flight limit, so one instance can be shared by
//! several pipelines without exceeding what the source tolerates.

mod error;
mod file;
mod http;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

pub use error::FetchError;
pub use file::FileRangeFetcher;
pub use http::HttpRangeFetcher;

/// Default number of concurrent range requests per fetcher.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 8;

/// Boxed future returned by [`ChunkFetcher`] methods.
pub type FetchFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, FetchError>> + Send + 'a>>;

/// What the source reports about itself before a transfer starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    /// Stable name of the source (URL or path).
    pub identity: String,
    pub size: u64,
    /// Modification time as reported by the source, if any.
    pub modified: Option<String>,
}

/// A byte-range capable source.
pub trait ChunkFetcher: Send + Sync {
    /// Identity, size and modification time of the source.
    fn describe(&self) -> FetchFuture<'_, SourceInfo>;

    /// Reads exactly `length` bytes starting at `offset`.
    fn fetch(&self, offset: u64, length: u64) -> FetchFuture<'_, Bytes>;
}
