//! Second phase of a copy: assemble the standalone parts written by the
//! transfer phase into the destination object with server-side part copies.
//!
//! The merge refuses to start until the manifest and the part listing agree
//! that every part is present, and deletes the parts directory only after
//! the assembled object has the size the manifest recorded.

mod engine;
mod error;
mod state;
mod types;

pub use engine::MergeEngine;
pub use error::MergeError;
pub use state::{MergePart, MergeState, StatePublisher, StateWriter, load_state};
pub use types::{MergeConfig, MergeEvent, MergeOutcome};
