//! Durable, fingerprinted record of which parts a session has finished.
//!
//! The record lives on local disk under the state directory. Every save
//! rewrites the full snapshot to a temporary file and renames it over the
//! previous one, so a crash mid-write leaves the last good record intact.

use std::path::{Path, PathBuf};

use bigcopy_types::{FinishedPart, FinishedSet, ObjectPath};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::{TransferError, UploadMode};

/// The request a checkpoint belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_modified: Option<String>,
    pub total_size: u64,
    pub chunk_size: u64,
    pub part_count: u32,
    pub destination: ObjectPath,
    pub mode: UploadMode,
    /// Multipart upload backing a native-mode session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
}

impl SessionInfo {
    /// Hex sha256 over source identity, total size, chunk size and part count.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.source.as_bytes());
        hasher.update(b"\n");
        hasher.update(self.total_size.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.chunk_size.to_string().as_bytes());
        hasher.update(b"\n");
        hasher.update(self.part_count.to_string().as_bytes());
        hex::encode(hasher.finalize())
    }
}

/// Persisted progress of one upload session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub session: SessionInfo,
    pub fingerprint: String,
    #[serde(default)]
    pub finished_parts: FinishedSet,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CheckpointRecord {
    pub fn new(session: SessionInfo) -> Self {
        let now = Utc::now();
        Self {
            fingerprint: session.fingerprint(),
            session,
            finished_parts: FinishedSet::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Location of the checkpoint for a destination. One destination has at
/// most one live session, whatever its chunk size.
pub fn checkpoint_path(state_dir: &Path, dst: &ObjectPath) -> PathBuf {
    let digest = Sha256::digest(dst.to_string().as_bytes());
    let name = hex::encode(&digest[..8]);
    state_dir.join(format!("{name}.checkpoint.json"))
}

/// Loads a checkpoint. Missing and unreadable records both yield `None`.
pub async fn load_checkpoint(path: &Path) -> Result<Option<CheckpointRecord>, TransferError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    match serde_json::from_slice(&data) {
        Ok(record) => Ok(Some(record)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "ignoring unreadable checkpoint");
            Ok(None)
        }
    }
}

/// Writes the full record atomically (temp file, fsync, rename).
pub async fn save_checkpoint(path: &Path, record: &CheckpointRecord) -> Result<(), TransferError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_vec_pretty(record)?;
    let tmp = path.with_extension("json.tmp");

    let mut file = tokio::fs::File::create(&tmp).await?;
    file.write_all(&json).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&tmp, path).await?;
    debug!(
        path = %path.display(),
        finished = record.finished_parts.len(),
        "checkpoint saved"
    );
    Ok(())
}

/// Deletes a checkpoint. Returns whether one existed.
pub async fn remove_checkpoint(path: &Path) -> Result<bool, TransferError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Fails with `FingerprintMismatch` unless the record belongs to `expected`.
pub fn validate_fingerprint(record: &CheckpointRecord, expected: &str) -> Result<(), TransferError> {
    // Recompute instead of trusting the stored field alone.
    let recomputed = record.session.fingerprint();
    if record.fingerprint != expected || recomputed != expected {
        return Err(TransferError::FingerprintMismatch {
            expected: expected.to_string(),
            found: record.fingerprint.clone(),
        });
    }
    Ok(())
}

/// Exclusive owner of a session's checkpoint while a pipeline runs.
///
/// Mutation and flush happen under the same lock, so the file on disk
/// always reflects a whole snapshot.
pub struct CheckpointHandle {
    path: PathBuf,
    record: Mutex<CheckpointRecord>,
}

impl CheckpointHandle {
    /// Takes ownership of `record` and persists it immediately.
    pub async fn create(path: PathBuf, record: CheckpointRecord) -> Result<Self, TransferError> {
        save_checkpoint(&path, &record).await?;
        Ok(Self {
            path,
            record: Mutex::new(record),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Adds a finished part and flushes. Returns `false` (without writing)
    /// if the part was already recorded.
    pub async fn record_finished(&self, part: FinishedPart) -> Result<bool, TransferError> {
        let mut record = self.record.lock().await;
        if !record.finished_parts.insert(part) {
            return Ok(false);
        }
        record.updated_at = Utc::now();
        save_checkpoint(&self.path, &record).await?;
        Ok(true)
    }

    pub async fn finished(&self) -> FinishedSet {
        self.record.lock().await.finished_parts.clone()
    }
}
