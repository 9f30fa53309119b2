//! Value types shared by the transfer and merge phases.
//!
//! Everything here is pure: byte ranges, the deterministic part plan,
//! finished-part bookkeeping, object naming inside a parts directory and
//! the retry/backoff policy.

mod finished;
mod format;
mod naming;
mod range;
mod retry;

pub use finished::{FinishedPart, FinishedSet};
pub use format::{collapse_runs, format_size};
pub use naming::{
    MANIFEST_NAME, MERGE_STATE_NAME, ObjectPath, PARTS_SUFFIX, PartsDir, parse_part_name,
    parse_part_number, part_object_name,
};
pub use range::{ByteRange, MIN_CHUNK_SIZE, PartInfo, PartPlan, PlanError, split};
pub use retry::RetryPolicy;

/// One mebibyte.
pub const MIB: u64 = 1024 * 1024;

/// Default part size: 96 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 96 * MIB;
