use std::future::Future;
use std::pin::Pin;

use bigcopy_types::{FinishedPart, ObjectPath};
use bytes::Bytes;
use chrono::{DateTime, Utc};

use crate::StoreError;

/// Boxed future returned by every [`ObjectStore`] method.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Metadata for a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectMeta {
    pub key: String,
    pub size: u64,
    pub etag: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Primitive object-storage operations used by the transfer and merge phases.
///
/// Implementations must be safe to call concurrently from many tasks.
pub trait ObjectStore: Send + Sync {
    /// Starts a multipart upload and returns its id.
    fn create_multipart_upload<'a>(&'a self, dst: &'a ObjectPath) -> StoreFuture<'a, String>;

    /// Uploads one part of a multipart upload. Returns the part's tag.
    fn upload_part<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
        part_number: u32,
        body: Bytes,
    ) -> StoreFuture<'a, String>;

    /// Copies a whole existing object into one part of a multipart upload.
    fn upload_part_copy<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
        part_number: u32,
        src: &'a ObjectPath,
    ) -> StoreFuture<'a, String>;

    /// Assembles the uploaded parts. `parts` must be sorted by part number.
    fn complete_multipart_upload<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
        parts: Vec<FinishedPart>,
    ) -> StoreFuture<'a, ()>;

    fn abort_multipart_upload<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()>;

    /// Writes a whole object. Returns its tag.
    fn put_object<'a>(&'a self, dst: &'a ObjectPath, body: Bytes) -> StoreFuture<'a, String>;

    /// Reads a whole object, `None` if it does not exist.
    fn get_object<'a>(&'a self, src: &'a ObjectPath) -> StoreFuture<'a, Option<Bytes>>;

    /// Object metadata, `None` if it does not exist.
    fn head_object<'a>(&'a self, src: &'a ObjectPath) -> StoreFuture<'a, Option<ObjectMeta>>;

    /// Lists every object whose key starts with `prefix`, sorted by key.
    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StoreFuture<'a, Vec<ObjectMeta>>;

    /// Deletes an object. Deleting a missing object is not an error.
    fn delete_object<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, ()>;
}
