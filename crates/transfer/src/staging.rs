//! Holding area for parts that have been fetched but not yet uploaded.
//!
//! The pipeline receives one [`StagingArea`] from its owner. A disk area
//! sweeps leftover `*.chunk` files from a crashed run when opened and purges
//! whatever remains when closed. Each [`StagedPart`] owns its file and
//! deletes it when dropped.

use std::path::{Path, PathBuf};

use bigcopy_types::PartInfo;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::TransferError;

const CHUNK_EXTENSION: &str = "chunk";

/// Where fetched bytes wait for the uploader stage.
///
/// Clones refer to the same directory.
#[derive(Debug, Clone)]
pub enum StagingArea {
    /// Keep fetched bytes in memory.
    Memory,
    /// Spill fetched bytes to files in a directory.
    Disk { dir: PathBuf },
}

impl StagingArea {
    pub fn memory() -> Self {
        Self::Memory
    }

    /// Opens (creating if needed) a disk staging directory and removes any
    /// chunk files left behind by an earlier process.
    pub async fn open_disk(dir: impl AsRef<Path>) -> Result<Self, TransferError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        let swept = sweep_chunks(&dir).await?;
        if swept > 0 {
            info!(dir = %dir.display(), swept, "removed orphaned staging files");
        }
        Ok(Self::Disk { dir })
    }

    /// Stages the fetched bytes of `part`.
    pub async fn stage(&self, part: PartInfo, data: Bytes) -> Result<StagedPart, TransferError> {
        match self {
            Self::Memory => Ok(StagedPart {
                part,
                data: StagedData::Memory(data),
            }),
            Self::Disk { dir } => {
                let path = dir.join(format!(
                    "{}.{CHUNK_EXTENSION}",
                    uuid::Uuid::new_v4().simple()
                ));
                // Construct the guard first so a failed write is still cleaned up.
                let staged = StagedPart {
                    part,
                    data: StagedData::Disk {
                        path: path.clone(),
                        len: data.len() as u64,
                    },
                };
                tokio::fs::write(&path, &data).await?;
                Ok(staged)
            }
        }
    }

    /// Removes every remaining staging file. Returns how many were removed.
    pub async fn close(self) -> Result<usize, TransferError> {
        match self {
            Self::Memory => Ok(0),
            Self::Disk { dir } => {
                let purged = sweep_chunks(&dir).await?;
                debug!(dir = %dir.display(), purged, "staging area closed");
                Ok(purged)
            }
        }
    }
}

async fn sweep_chunks(dir: &Path) -> Result<usize, TransferError> {
    let mut removed = 0;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(CHUNK_EXTENSION) {
            continue;
        }
        match tokio::fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(removed)
}

#[derive(Debug)]
enum StagedData {
    Memory(Bytes),
    Disk { path: PathBuf, len: u64 },
}

/// The fetched bytes of one part, exclusively owned.
#[derive(Debug)]
pub struct StagedPart {
    part: PartInfo,
    data: StagedData,
}

impl StagedPart {
    pub fn part(&self) -> &PartInfo {
        &self.part
    }

    pub fn len(&self) -> u64 {
        match &self.data {
            StagedData::Memory(b) => b.len() as u64,
            StagedData::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The staged bytes. Disk-backed parts are read back on each call.
    pub async fn bytes(&self) -> Result<Bytes, TransferError> {
        match &self.data {
            StagedData::Memory(b) => Ok(b.clone()),
            StagedData::Disk { path, .. } => Ok(Bytes::from(tokio::fs::read(path).await?)),
        }
    }
}

impl Drop for StagedPart {
    fn drop(&mut self) {
        if let StagedData::Disk { path, .. } = &self.data
            && let Err(e) = std::fs::remove_file(path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %e, "failed to remove staging file");
        }
    }
}
