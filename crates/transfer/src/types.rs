use std::path::PathBuf;
use std::time::Duration;

use bigcopy_types::{DEFAULT_CHUNK_SIZE, MIN_CHUNK_SIZE, RetryPolicy};
use serde::{Deserialize, Serialize};

use crate::TransferError;

/// How parts reach the destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadMode {
    /// Each part becomes its own object in the parts directory; a later
    /// merge assembles them.
    #[default]
    StandaloneParts,
    /// Parts go straight into one multipart upload on the destination.
    NativeMultipart,
}

/// What to do when a saved checkpoint does not match the current request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResumePolicy {
    /// Discard the checkpoint (aborting its multipart upload) and start over.
    #[default]
    Restart,
    /// Fail with `FingerprintMismatch`.
    Refuse,
}

/// Settings for one transfer run.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: u64,
    /// Reader stage slots (N).
    pub read_concurrency: usize,
    /// Uploader stage slots (M).
    pub write_concurrency: usize,
    /// Fetched parts that may wait between the stages (Q).
    pub queue_capacity: usize,
    pub retry: RetryPolicy,
    pub mode: UploadMode,
    pub resume_policy: ResumePolicy,
    /// Stop after this many parts and report `Suspended`.
    pub max_parts_per_run: Option<u32>,
    /// Restrict the session to parts `first..=last` of the plan.
    pub part_range: Option<(u32, u32)>,
    /// Directory holding local checkpoints.
    pub state_dir: PathBuf,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_concurrency: 4,
            write_concurrency: 10,
            queue_capacity: 1,
            retry: RetryPolicy::default(),
            mode: UploadMode::default(),
            resume_policy: ResumePolicy::default(),
            max_parts_per_run: None,
            part_range: None,
            state_dir: PathBuf::from(".bigcopy"),
        }
    }
}

impl TransferConfig {
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(TransferError::Config(format!(
                "chunk size {} is below the {MIN_CHUNK_SIZE} byte minimum",
                self.chunk_size
            )));
        }
        if self.read_concurrency == 0 || self.write_concurrency == 0 {
            return Err(TransferError::Config(
                "read and write concurrency must be at least 1".into(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(TransferError::Config("queue capacity must be at least 1".into()));
        }
        if self.max_parts_per_run == Some(0) {
            return Err(TransferError::Config("max parts per run must be at least 1".into()));
        }
        Ok(())
    }
}

/// Lifecycle of one part inside the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartState {
    Pending,
    Fetching,
    Fetched,
    Uploading,
    Done,
    Failed,
}

/// Snapshot of overall progress.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferProgress {
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    pub finished_parts: u32,
    pub total_parts: u32,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

impl TransferProgress {
    /// Progress as a percentage (0-100).
    pub fn percentage(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        self.transferred_bytes as f64 / self.total_bytes as f64 * 100.0
    }
}

/// Events emitted while a transfer runs.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// The plan is known and resume state has been applied.
    PlanReady {
        total_parts: u32,
        already_finished: u32,
        scheduled: Vec<u32>,
    },
    PartState {
        part: u32,
        state: PartState,
    },
    PartUploaded {
        part: u32,
        bytes: u64,
    },
    Progress(TransferProgress),
}

/// How a transfer run ended, short of a hard failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Every part was uploaded by this run.
    UploadedFresh { parts: u32, bytes: u64 },
    /// Some parts came from an earlier run; this run uploaded the rest.
    UploadedResume { uploaded: u32, skipped: u32, bytes: u64 },
    /// The per-run part limit was reached with work left.
    Suspended { finished: u32, remaining: u32 },
    /// Nothing was left to do.
    AlreadyDone,
}

impl TransferOutcome {
    /// Whether every part of the session is now stored.
    pub fn is_complete(&self) -> bool {
        !matches!(self, Self::Suspended { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(TransferConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_rejects_small_chunks_and_zero_slots() {
        let small = TransferConfig {
            chunk_size: 1024,
            ..TransferConfig::default()
        };
        assert!(matches!(small.validate(), Err(TransferError::Config(_))));

        let no_writers = TransferConfig {
            write_concurrency: 0,
            ..TransferConfig::default()
        };
        assert!(no_writers.validate().is_err());

        let no_queue = TransferConfig {
            queue_capacity: 0,
            ..TransferConfig::default()
        };
        assert!(no_queue.validate().is_err());
    }

    #[test]
    fn upload_mode_serializes_snake_case() {
        let json = serde_json::to_string(&UploadMode::NativeMultipart).unwrap();
        assert_eq!(json, "\"native_multipart\"");
        let mode: UploadMode = serde_json::from_str("\"standalone_parts\"").unwrap();
        assert_eq!(mode, UploadMode::StandaloneParts);
    }

    #[test]
    fn progress_percentage() {
        let p = TransferProgress {
            transferred_bytes: 25,
            total_bytes: 100,
            finished_parts: 1,
            total_parts: 4,
            bytes_per_second: 0.0,
            eta: None,
        };
        assert_eq!(p.percentage(), 25.0);
    }
}
