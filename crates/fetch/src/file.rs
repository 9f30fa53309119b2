//! Range reads from a local file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Semaphore;

use crate::{ChunkFetcher, FetchError, FetchFuture, SourceInfo};

/// Reads byte ranges from a file on disk.
pub struct FileRangeFetcher {
    path: PathBuf,
    permits: Arc<Semaphore>,
}

impl FileRangeFetcher {
    pub fn new(path: impl AsRef<Path>, max_in_flight: usize) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            permits: Arc::new(Semaphore::new(max_in_flight.max(1))),
        }
    }

    async fn stat(&self) -> Result<SourceInfo, FetchError> {
        let meta = tokio::fs::metadata(&self.path).await?;
        let modified = meta
            .modified()
            .ok()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339());
        Ok(SourceInfo {
            identity: self.path.display().to_string(),
            size: meta.len(),
            modified,
        })
    }

    async fn read_range(&self, offset: u64, length: u64) -> Result<Bytes, FetchError> {
        if length == 0 {
            return Err(FetchError::InvalidRange("zero-length read".into()));
        }
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut buf = BytesMut::zeroed(length as usize);
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(FetchError::ShortRead {
                    expected: length,
                    actual: filled as u64,
                });
            }
            filled += n;
        }
        Ok(buf.freeze())
    }
}

impl ChunkFetcher for FileRangeFetcher {
    fn describe(&self) -> FetchFuture<'_, SourceInfo> {
        Box::pin(self.stat())
    }

    fn fetch(&self, offset: u64, length: u64) -> FetchFuture<'_, Bytes> {
        Box::pin(self.read_range(offset, length))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_source(dir: &TempDir, len: usize) -> PathBuf {
        let path = dir.path().join("source.bin");
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, data).unwrap();
        path
    }

    #[tokio::test]
    async fn describe_reports_size() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, 1000);
        let fetcher = FileRangeFetcher::new(&path, 2);
        let info = fetcher.describe().await.unwrap();
        assert_eq!(info.size, 1000);
        assert!(info.modified.is_some());
        assert!(info.identity.ends_with("source.bin"));
    }

    #[tokio::test]
    async fn fetch_returns_exact_slice() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, 1000);
        let fetcher = FileRangeFetcher::new(&path, 2);
        let bytes = fetcher.fetch(500, 10).await.unwrap();
        let expected: Vec<u8> = (500..510).map(|i| (i % 251) as u8).collect();
        assert_eq!(&bytes[..], &expected[..]);
    }

    #[tokio::test]
    async fn fetch_past_end_is_short_read() {
        let dir = TempDir::new().unwrap();
        let path = write_source(&dir, 100);
        let fetcher = FileRangeFetcher::new(&path, 1);
        let err = fetcher.fetch(90, 20).await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::ShortRead {
                expected: 20,
                actual: 10
            }
        ));
    }

    #[tokio::test]
    async fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let fetcher = FileRangeFetcher::new(dir.path().join("nope"), 1);
        assert!(matches!(
            fetcher.describe().await,
            Err(FetchError::Io(_))
        ));
    }
}
