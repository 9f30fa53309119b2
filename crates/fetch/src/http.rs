//! Range requests against an HTTP endpoint serving a single source object.

use std::sync::{Arc, OnceLock};

use bigcopy_types::ByteRange;
use bytes::Bytes;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, LAST_MODIFIED, RANGE};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::{ChunkFetcher, FetchError, FetchFuture, SourceInfo};

/// Fetches byte ranges with `GET` + `Range`, at most `max_in_flight` at a time.
pub struct HttpRangeFetcher {
    client: reqwest::Client,
    url: String,
    permits: Arc<Semaphore>,
    known_size: OnceLock<u64>,
}

impl HttpRangeFetcher {
    pub fn new(client: reqwest::Client, url: impl Into<String>, max_in_flight: usize) -> Self {
        Self {
            client,
            url: url.into(),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
            known_size: OnceLock::new(),
        }
    }

    /// Pins the size every `Content-Range` total must match. Set
    /// automatically by [`ChunkFetcher::describe`].
    pub fn with_expected_size(self, size: u64) -> Self {
        let _ = self.known_size.set(size);
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn head(&self) -> Result<SourceInfo, FetchError> {
        let resp = self.client.head(&self.url).send().await?;
        if !resp.status().is_success() {
            return Err(FetchError::Status {
                status: resp.status().as_u16(),
                range: "HEAD".into(),
            });
        }
        let size = resp
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or(FetchError::MissingLength)?;
        let modified = resp
            .headers()
            .get(LAST_MODIFIED)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if let Some(previous) = self.known_size.get()
            && *previous != size
        {
            return Err(FetchError::SizeChanged {
                expected: *previous,
                actual: size,
            });
        }
        let _ = self.known_size.set(size);

        Ok(SourceInfo {
            identity: self.url.clone(),
            size,
            modified,
        })
    }

    async fn get_range(&self, offset: u64, length: u64) -> Result<Bytes, FetchError> {
        let end = offset
            .checked_add(length)
            .ok_or_else(|| FetchError::InvalidRange(format!("{offset}+{length} overflows")))?;
        let range = ByteRange::new(offset, end)
            .map_err(|e| FetchError::InvalidRange(e.to_string()))?;

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let header = range.to_header();
        let resp = self
            .client
            .get(&self.url)
            .header(RANGE, &header)
            .send()
            .await?;

        match resp.status() {
            StatusCode::PARTIAL_CONTENT => {
                if let Some(total) = content_range_total(resp.headers().get(CONTENT_RANGE))
                    && let Some(expected) = self.known_size.get()
                    && total != *expected
                {
                    return Err(FetchError::SizeChanged {
                        expected: *expected,
                        actual: total,
                    });
                }
            }
            // A server that ignores `Range` answers with the whole body. That
            // is only usable when the whole body is the range asked for.
            StatusCode::OK if offset == 0 => {
                debug!(url = %self.url, "server ignored Range header");
            }
            status => {
                return Err(FetchError::Status {
                    status: status.as_u16(),
                    range: header,
                });
            }
        }

        let body = resp.bytes().await?;
        if body.len() as u64 != length {
            warn!(
                url = %self.url,
                range = %range,
                got = body.len(),
                "range response length mismatch"
            );
            return Err(FetchError::ShortRead {
                expected: length,
                actual: body.len() as u64,
            });
        }
        Ok(body)
    }
}

/// Total size from a `Content-Range: bytes a-b/total` header.
fn content_range_total(value: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let text = value?.to_str().ok()?;
    let (_, total) = text.rsplit_once('/')?;
    total.trim().parse().ok()
}

impl ChunkFetcher for HttpRangeFetcher {
    fn describe(&self) -> FetchFuture<'_, SourceInfo> {
        Box::pin(self.head())
    }

    fn fetch(&self, offset: u64, length: u64) -> FetchFuture<'_, Bytes> {
        Box::pin(self.get_range(offset, length))
    }
}
