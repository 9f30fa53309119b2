use std::path::PathBuf;

use bigcopy_types::RetryPolicy;

use crate::MergeError;

/// Settings for one merge run.
#[derive(Debug, Clone)]
pub struct MergeConfig {
    /// Concurrent part copies. Storage-side copies throttle early, so this
    /// stays well below the transfer concurrency.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Where the transfer phase keeps its checkpoints. The checkpoint of the
    /// merged destination is removed after cleanup.
    pub state_dir: Option<PathBuf>,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry: RetryPolicy::default(),
            state_dir: None,
        }
    }
}

impl MergeConfig {
    pub fn validate(&self) -> Result<(), MergeError> {
        if self.concurrency == 0 {
            return Err(MergeError::Config("merge concurrency must be at least 1".into()));
        }
        Ok(())
    }
}

/// Events emitted while a merge runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeEvent {
    /// Merge state is in place; `finished` parts need no copy.
    Assembling { total_parts: u32, finished: u32 },
    PartCopied { part: u32, copied: u32, total_parts: u32 },
    Completing { parts: u32 },
    Verified { size: u64 },
    CleanupDone { removed: usize },
}

/// How a merge run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The destination was assembled by this run.
    Merged { parts: u32, copied: u32, size: u64 },
    /// The destination was already assembled.
    AlreadyDone,
}
