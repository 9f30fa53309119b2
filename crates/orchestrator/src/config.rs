//! Copy configuration.
//!
//! Stored as JSON. Every field has a default, so a partial file only
//! overrides what it names.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bigcopy_merge::MergeConfig;
use bigcopy_transfer::{ResumePolicy, TransferConfig, UploadMode};
use bigcopy_types::{DEFAULT_CHUNK_SIZE, RetryPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::CopyError;

/// Where fetched parts wait before upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingKind {
    #[default]
    Memory,
    /// Temporary files under `staging_dir`.
    Disk,
}

/// Settings for a resumable copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub chunk_size: u64,
    pub read_concurrency: usize,
    pub write_concurrency: usize,
    pub queue_capacity: usize,
    pub merge_concurrency: usize,
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_parts_per_run: Option<u32>,
    pub upload_mode: UploadMode,
    pub resume_policy: ResumePolicy,
    pub staging: StagingKind,
    /// Defaults to `{state_dir}/staging`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    /// Directory holding local checkpoints.
    pub state_dir: PathBuf,
}

impl Default for CopyConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            read_concurrency: 4,
            write_concurrency: 10,
            queue_capacity: 1,
            merge_concurrency: 5,
            max_retries: 9,
            retry_initial_delay_ms: 1000,
            retry_max_delay_ms: 60_000,
            max_parts_per_run: None,
            upload_mode: UploadMode::default(),
            resume_policy: ResumePolicy::default(),
            staging: StagingKind::default(),
            staging_dir: None,
            state_dir: PathBuf::from(".bigcopy"),
        }
    }
}

impl CopyConfig {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields the defaults. So does a file that cannot be
    /// read or parsed, with a warning.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read config, using defaults");
                return Self::default();
            }
        };
        match serde_json::from_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "invalid config, using defaults");
                Self::default()
            }
        }
    }

    /// Writes the configuration to `path`, replacing it atomically.
    pub fn save(&self, path: &Path) -> Result<(), CopyError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, content)?;
        std::fs::rename(&tmp, path)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<(), CopyError> {
        self.transfer_config().validate()?;
        self.merge_config().validate()?;
        if self.retry_initial_delay_ms > self.retry_max_delay_ms {
            return Err(CopyError::Config(format!(
                "initial retry delay {}ms exceeds the maximum {}ms",
                self.retry_initial_delay_ms, self.retry_max_delay_ms
            )));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn transfer_config(&self) -> TransferConfig {
        TransferConfig {
            chunk_size: self.chunk_size,
            read_concurrency: self.read_concurrency,
            write_concurrency: self.write_concurrency,
            queue_capacity: self.queue_capacity,
            retry: self.retry_policy(),
            mode: self.upload_mode,
            resume_policy: self.resume_policy,
            max_parts_per_run: self.max_parts_per_run,
            part_range: None,
            state_dir: self.state_dir.clone(),
        }
    }

    pub fn merge_config(&self) -> MergeConfig {
        MergeConfig {
            concurrency: self.merge_concurrency,
            retry: self.retry_policy(),
            state_dir: Some(self.state_dir.clone()),
        }
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| self.state_dir.join("staging"))
    }
}
