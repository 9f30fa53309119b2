//! Resumable chunked transfer of one large source into object storage.
//!
//! The pipeline reads parts through a [`ChunkFetcher`](bigcopy_fetch::ChunkFetcher),
//! uploads them through an [`ObjectStore`](bigcopy_store::ObjectStore) and
//! records every finished part in a local checkpoint before acknowledging
//! it, so an interrupted run resumes where it stopped.

mod checkpoint;
mod error;
mod manifest;
mod pipeline;
mod progress;
mod retry;
mod staging;
mod types;
mod validation;

pub use checkpoint::{
    CheckpointHandle, CheckpointRecord, SessionInfo, checkpoint_path, load_checkpoint,
    remove_checkpoint, save_checkpoint, validate_fingerprint,
};
pub use error::TransferError;
pub use manifest::{Manifest, list_part_objects, remove_parts_dir};
pub use pipeline::TransferPipeline;
pub use progress::{ProgressTracker, SpeedCalculator};
pub use retry::{RetryError, Retryable, with_retry};
pub use staging::{StagedPart, StagingArea};
pub use types::{
    PartState, ResumePolicy, TransferConfig, TransferEvent, TransferOutcome, TransferProgress,
    UploadMode,
};
pub use validation::validate_object_key;

/// Capacity of the event channel handed out by embedding applications.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;
