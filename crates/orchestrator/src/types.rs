//! Data types for the copy flow.

use bigcopy_merge::{MergeEvent, MergeOutcome};
use bigcopy_transfer::{TransferEvent, TransferOutcome};

/// Events emitted while a copy runs.
#[derive(Debug, Clone)]
pub enum CopyEvent {
    Transfer(TransferEvent),
    Merge(MergeEvent),
    /// The destination object is complete.
    Completed { dst: String },
    Failed { dst: String, error: String },
}

/// How a copy ended, short of a hard failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyOutcome {
    /// The destination was written by this run. `merge` is `None` in
    /// native multipart mode, where the transfer assembles it directly.
    Copied {
        transfer: TransferOutcome,
        merge: Option<MergeOutcome>,
    },
    /// The part budget ran out; run again to continue.
    Suspended { finished: u32, remaining: u32 },
    /// The destination was already complete.
    AlreadyDone,
}
