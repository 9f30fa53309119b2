//! In-process object store.
//!
//! Objects are kept as lists of `Bytes` segments so that part copies and
//! multipart completion never duplicate payloads. Every call is counted per
//! operation, and transient failures can be injected per operation.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use bigcopy_types::{FinishedPart, MIN_CHUNK_SIZE, ObjectPath};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use tracing::debug;

use crate::{ObjectMeta, ObjectStore, StoreError, StoreFuture};

/// Operations tracked by [`MemoryStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    CreateMultipartUpload,
    UploadPart,
    UploadPartCopy,
    CompleteMultipartUpload,
    AbortMultipartUpload,
    PutObject,
    GetObject,
    HeadObject,
    ListObjects,
    DeleteObject,
}

struct StoredObject {
    segments: Vec<Bytes>,
    size: u64,
    etag: String,
    last_modified: DateTime<Utc>,
}

struct UploadedPart {
    segments: Vec<Bytes>,
    size: u64,
    etag: String,
}

struct PendingUpload {
    dst: ObjectPath,
    parts: BTreeMap<u32, UploadedPart>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<(String, String), StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    calls: HashMap<StoreOp, usize>,
    failures: HashMap<StoreOp, u32>,
}

/// Object store held entirely in memory.
pub struct MemoryStore {
    state: Mutex<State>,
    hash_content: bool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Creates an empty store with md5 tags and the S3 minimum part size.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            hash_content: true,
        }
    }

    /// Use random tags instead of hashing payloads. Speeds up tests that
    /// move hundreds of megabytes.
    pub fn without_content_hashing(mut self) -> Self {
        self.hash_content = false;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counts the call and applies any injected failure.
    fn begin(&self, op: StoreOp) -> Result<MutexGuard<'_, State>, StoreError> {
        let mut state = self.lock();
        *state.calls.entry(op).or_default() += 1;
        if let Some(remaining) = state.failures.get_mut(&op)
            && *remaining > 0
        {
            *remaining -= 1;
            debug!(?op, remaining = *remaining, "injected storage failure");
            return Err(StoreError::Transient(format!("injected failure for {op:?}")));
        }
        Ok(state)
    }

    /// Makes the next `count` calls of `op` fail with a transient error.
    pub fn inject_failures(&self, op: StoreOp, count: u32) {
        self.lock().failures.insert(op, count);
    }

    /// Number of times `op` has been called.
    pub fn call_count(&self, op: StoreOp) -> usize {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Resets all call counters.
    pub fn reset_calls(&self) {
        self.lock().calls.clear();
    }

    /// Stores an object directly, bypassing counters and failure injection.
    pub fn insert_object(&self, path: &ObjectPath, body: Bytes) {
        let etag = self.tag_for(std::slice::from_ref(&body));
        let size = body.len() as u64;
        self.lock().objects.insert(
            key_of(path),
            StoredObject {
                segments: vec![body],
                size,
                etag,
                last_modified: Utc::now(),
            },
        );
    }

    /// Full contents of an object, bypassing counters.
    pub fn object_bytes(&self, path: &ObjectPath) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&key_of(path))
            .map(|o| concat(&o.segments))
    }

    /// Ids of multipart uploads that are neither completed nor aborted.
    pub fn open_uploads(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock().uploads.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn tag_for(&self, segments: &[Bytes]) -> String {
        if !self.hash_content {
            return uuid::Uuid::new_v4().simple().to_string();
        }
        let mut hasher = Md5::new();
        for segment in segments {
            hasher.update(segment);
        }
        hex::encode(hasher.finalize())
    }

    fn multipart_tag(&self, parts: &[&UploadedPart]) -> String {
        let mut hasher = Md5::new();
        for part in parts {
            hasher.update(part.etag.as_bytes());
        }
        format!("{}-{}", hex::encode(hasher.finalize()), parts.len())
    }
}

fn key_of(path: &ObjectPath) -> (String, String) {
    (path.bucket.clone(), path.key.clone())
}

fn concat(segments: &[Bytes]) -> Bytes {
    match segments {
        [] => Bytes::new(),
        [single] => single.clone(),
        many => {
            let total = many.iter().map(Bytes::len).sum();
            let mut buf = BytesMut::with_capacity(total);
            for segment in many {
                buf.extend_from_slice(segment);
            }
            buf.freeze()
        }
    }
}

fn pending_upload<'s>(
    state: &'s mut State,
    dst: &ObjectPath,
    upload_id: &str,
) -> Result<&'s mut PendingUpload, StoreError> {
    match state.uploads.get_mut(upload_id) {
        Some(upload) if upload.dst == *dst => Ok(upload),
        _ => Err(StoreError::NoSuchUpload(upload_id.to_string())),
    }
}

impl ObjectStore for MemoryStore {
    fn create_multipart_upload<'a>(&'a self, dst: &'a ObjectPath) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.begin(StoreOp::CreateMultipartUpload)?;
            let upload_id = uuid::Uuid::new_v4().to_string();
            state.uploads.insert(
                upload_id.clone(),
                PendingUpload {
                    dst: dst.clone(),
                    parts: BTreeMap::new(),
                },
            );
            Ok(upload_id)
        })
    }

    fn upload_part<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
        part_number: u32,
        body: Bytes,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let etag = self.tag_for(std::slice::from_ref(&body));
            let mut state = self.begin(StoreOp::UploadPart)?;
            let upload = pending_upload(&mut state, dst, upload_id)?;
            let size = body.len() as u64;
            upload.parts.insert(
                part_number,
                UploadedPart {
                    segments: vec![body],
                    size,
                    etag: etag.clone(),
                },
            );
            Ok(etag)
        })
    }

    fn upload_part_copy<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
        part_number: u32,
        src: &'a ObjectPath,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let mut state = self.begin(StoreOp::UploadPartCopy)?;
            let source = state
                .objects
                .get(&key_of(src))
                .ok_or_else(|| StoreError::NotFound(src.to_string()))?;
            let part = UploadedPart {
                segments: source.segments.clone(),
                size: source.size,
                etag: source.etag.clone(),
            };
            let etag = part.etag.clone();
            pending_upload(&mut state, dst, upload_id)?
                .parts
                .insert(part_number, part);
            Ok(etag)
        })
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
        parts: Vec<FinishedPart>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin(StoreOp::CompleteMultipartUpload)?;
            if parts.is_empty() {
                return Err(StoreError::InvalidPart("empty part list".into()));
            }
            if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
                return Err(StoreError::InvalidPart(
                    "parts must be in ascending order".into(),
                ));
            }

            let upload = pending_upload(&mut state, dst, upload_id)?;
            let mut chosen = Vec::with_capacity(parts.len());
            for (index, requested) in parts.iter().enumerate() {
                let stored = upload.parts.get(&requested.part_number).ok_or_else(|| {
                    StoreError::InvalidPart(format!("part {} was not uploaded", requested.part_number))
                })?;
                if stored.etag != requested.etag.trim_matches('"') {
                    return Err(StoreError::InvalidPart(format!(
                        "tag mismatch for part {}",
                        requested.part_number
                    )));
                }
                let is_last = index + 1 == parts.len();
                if !is_last && stored.size < MIN_CHUNK_SIZE {
                    return Err(StoreError::EntityTooSmall {
                        part_number: requested.part_number,
                        size: stored.size,
                    });
                }
                chosen.push(stored);
            }

            let etag = self.multipart_tag(&chosen);
            let segments: Vec<Bytes> = chosen
                .iter()
                .flat_map(|p| p.segments.iter().cloned())
                .collect();
            let size = chosen.iter().map(|p| p.size).sum();

            state.uploads.remove(upload_id);
            state.objects.insert(
                key_of(dst),
                StoredObject {
                    segments,
                    size,
                    etag,
                    last_modified: Utc::now(),
                },
            );
            Ok(())
        })
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        dst: &'a ObjectPath,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin(StoreOp::AbortMultipartUpload)?;
            pending_upload(&mut state, dst, upload_id)?;
            state.uploads.remove(upload_id);
            Ok(())
        })
    }

    fn put_object<'a>(&'a self, dst: &'a ObjectPath, body: Bytes) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let etag = self.tag_for(std::slice::from_ref(&body));
            let mut state = self.begin(StoreOp::PutObject)?;
            let size = body.len() as u64;
            state.objects.insert(
                key_of(dst),
                StoredObject {
                    segments: vec![body],
                    size,
                    etag: etag.clone(),
                    last_modified: Utc::now(),
                },
            );
            Ok(etag)
        })
    }

    fn get_object<'a>(&'a self, src: &'a ObjectPath) -> StoreFuture<'a, Option<Bytes>> {
        Box::pin(async move {
            let state = self.begin(StoreOp::GetObject)?;
            Ok(state.objects.get(&key_of(src)).map(|o| concat(&o.segments)))
        })
    }

    fn head_object<'a>(&'a self, src: &'a ObjectPath) -> StoreFuture<'a, Option<ObjectMeta>> {
        Box::pin(async move {
            let state = self.begin(StoreOp::HeadObject)?;
            Ok(state.objects.get(&key_of(src)).map(|o| ObjectMeta {
                key: src.key.clone(),
                size: o.size,
                etag: Some(o.etag.clone()),
                last_modified: Some(o.last_modified),
            }))
        })
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StoreFuture<'a, Vec<ObjectMeta>> {
        Box::pin(async move {
            let state = self.begin(StoreOp::ListObjects)?;
            Ok(state
                .objects
                .iter()
                .filter(|((b, k), _)| b == bucket && k.starts_with(prefix))
                .map(|((_, k), o)| ObjectMeta {
                    key: k.clone(),
                    size: o.size,
                    etag: Some(o.etag.clone()),
                    last_modified: Some(o.last_modified),
                })
                .collect())
        })
    }

    fn delete_object<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.begin(StoreOp::DeleteObject)?;
            state.objects.remove(&key_of(path));
            Ok(())
        })
    }
}
