//! Object-storage client seam.
//!
//! The transfer and merge phases only talk to storage through
//! [`ObjectStore`]. [`MemoryStore`] backs tests and dry runs; the `s3`
//! feature adds an implementation over `aws-sdk-s3`.

mod error;
mod memory;
#[cfg(feature = "s3")]
mod s3;
mod store;

pub use error::StoreError;
pub use memory::{MemoryStore, StoreOp};
#[cfg(feature = "s3")]
pub use s3::S3Store;
pub use store::{ObjectMeta, ObjectStore, StoreFuture};
