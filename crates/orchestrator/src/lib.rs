//! Resumable copy of one large source into object storage.
//!
//! [`ResumableCopy`] runs the two phases in order:
//!
//! 1. **Transfer** - fetch the source in parts and upload each one,
//!    checkpointing as parts finish
//! 2. **Merge** - assemble standalone part objects into the destination
//!    with server-side copies, then clean up
//!
//! Either phase can be interrupted and picks up where it stopped on the
//! next run.

mod config;
mod copy;
mod error;
mod logging;
mod types;

pub use config::{CopyConfig, StagingKind};
pub use copy::ResumableCopy;
pub use error::CopyError;
pub use logging::{DEFAULT_FILTER, init_tracing};
pub use types::{CopyEvent, CopyOutcome};
