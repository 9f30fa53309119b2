//! Server-side assembly of a parts directory into its destination object.
//!
//! Copies every standalone part into one multipart upload on the
//! destination, completes it, verifies the size and only then deletes the
//! parts directory. Progress lives in `merge.json`, so an interrupted merge
//! resumes with the same upload and copies only what is missing.

use std::sync::Arc;

use bigcopy_store::{ObjectMeta, ObjectStore, StoreError};
use bigcopy_transfer::{
    Manifest, RetryError, checkpoint_path, list_part_objects, remove_checkpoint, remove_parts_dir,
    with_retry,
};
use bigcopy_types::{FinishedPart, ObjectPath, PartsDir, RetryPolicy, collapse_runs, format_size};
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::state::{MergePart, MergeState, StatePublisher, StateWriter, load_state};
use crate::types::{MergeConfig, MergeEvent, MergeOutcome};
use crate::MergeError;

/// Assembles finished transfers.
pub struct MergeEngine {
    store: Arc<dyn ObjectStore>,
    config: MergeConfig,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<MergeEvent>>,
}

impl MergeEngine {
    pub fn new(store: Arc<dyn ObjectStore>, config: MergeConfig) -> Self {
        Self {
            store,
            config,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: mpsc::Sender<MergeEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    fn emit(&self, event: MergeEvent) {
        emit(&self.events, event);
    }

    /// Merges the parts in `dir` into `dir.destination()`.
    pub async fn run(&self, dir: &PartsDir) -> Result<MergeOutcome, MergeError> {
        self.config.validate()?;
        if self.cancel.is_cancelled() {
            return Err(MergeError::Cancelled);
        }
        let result = self.merge(dir).await;
        match &result {
            Ok(outcome) => info!(dir = %dir, ?outcome, "merge finished"),
            Err(MergeError::Cancelled) => info!(dir = %dir, "merge cancelled"),
            Err(e) => error!(dir = %dir, error = %e, "merge failed"),
        }
        result
    }

    async fn merge(&self, dir: &PartsDir) -> Result<MergeOutcome, MergeError> {
        let store = self.store.as_ref();
        let retry = &self.config.retry;
        let dst = dir.destination();

        let Some(manifest) = Manifest::read(store, dir, retry, &self.cancel).await? else {
            // A finished merge leaves the destination and at most the tail
            // of an interrupted cleanup.
            if self.head(&dst).await?.is_some() {
                let removed = remove_parts_dir(store, dir, retry, &self.cancel).await?;
                if removed > 0 {
                    info!(dir = %dir, removed, "removed leftovers of an earlier cleanup");
                }
                self.forget_checkpoint(&dst).await?;
                return Ok(MergeOutcome::AlreadyDone);
            }
            return Err(MergeError::ManifestMissing(dir.to_string()));
        };

        let listing = list_part_objects(store, dir, retry, &self.cancel).await?;
        let expected = manifest.expected_size()?;
        let parts: Vec<MergePart> = manifest
            .parts()?
            .iter()
            .map(|p| MergePart {
                part_number: p.part_number,
                source_object_key: dir.part_key(p),
            })
            .collect();
        let state_path = ObjectPath::new(dir.bucket(), dir.merge_state_key());

        let existing = load_state(store, &state_path, retry, &self.cancel).await?;
        if let Some(state) = &existing
            && state.completed
            && state.matches(&dst, &parts)
        {
            debug!(dst = %dst, "upload completed by an earlier run");
            self.verify(&dst, expected).await?;
            self.cleanup(dir, &dst).await?;
            return Ok(MergeOutcome::AlreadyDone);
        }

        let missing = manifest.remaining_part_numbers(&listing)?;
        if !missing.is_empty() {
            // Cleanup stopped between the merge state and the manifest.
            if listing.is_empty()
                && existing.is_none()
                && self.head(&dst).await?.is_some_and(|meta| meta.size == expected)
            {
                debug!(dst = %dst, "only the manifest is left");
                self.cleanup(dir, &dst).await?;
                return Ok(MergeOutcome::AlreadyDone);
            }
            return Err(MergeError::TransferIncomplete {
                count: missing.len(),
                remaining: collapse_runs(&missing),
            });
        }

        let writer = StateWriter::spawn(Arc::clone(&self.store), state_path, retry.clone());
        let result = self.assemble(&dst, &parts, existing, &writer).await;
        let closed = writer.close().await;
        let copied = result?;
        closed?;

        let size = self.verify(&dst, expected).await?;
        self.cleanup(dir, &dst).await?;
        Ok(MergeOutcome::Merged {
            parts: parts.len() as u32,
            copied,
            size,
        })
    }

    /// Copies and completes. Returns the number of parts copied by this run.
    async fn assemble(
        &self,
        dst: &ObjectPath,
        parts: &[MergePart],
        existing: Option<MergeState>,
        writer: &StateWriter,
    ) -> Result<u32, MergeError> {
        let store = self.store.as_ref();
        let retry = &self.config.retry;

        let state = match existing {
            Some(state) if state.matches(dst, parts) => {
                debug!(
                    dst = %dst,
                    upload_id = %state.upload_id,
                    finished = state.finished.len(),
                    "resuming merge"
                );
                state
            }
            stale => {
                if let Some(stale) = stale {
                    warn!(upload_id = %stale.upload_id, "merge state describes another merge, starting over");
                    self.abort(&stale.destination(), &stale.upload_id).await;
                }
                let upload_id = with_retry(retry, &self.cancel, "create multipart upload", |_| {
                    store.create_multipart_upload(dst)
                })
                .await
                .map_err(MergeError::from_retry)?;
                debug!(dst = %dst, upload_id = %upload_id, "merge upload created");
                let state = MergeState::new(upload_id, dst, parts.to_vec());
                // The upload id must be durable before any copy.
                writer.publish(state.clone())?;
                writer.flush().await?;
                state
            }
        };

        let total = state.all_parts.len() as u32;
        let remaining = state.remaining();
        self.emit(MergeEvent::Assembling {
            total_parts: total,
            finished: total - remaining.len() as u32,
        });
        let upload_id = state.upload_id.clone();
        let state = Arc::new(Mutex::new(state));

        let copied = if remaining.is_empty() {
            0
        } else {
            self.copy_parts(dst, &upload_id, remaining, &state, writer.publisher())
                .await?
        };
        writer.flush().await?;

        let completion = state.lock().await.completion_parts();
        self.emit(MergeEvent::Completing {
            parts: completion.len() as u32,
        });
        let completed = with_retry(retry, &self.cancel, "complete multipart upload", |_| {
            store.complete_multipart_upload(dst, &upload_id, completion.clone())
        })
        .await;
        match completed {
            Ok(()) => {}
            // Completed before a crash; verification decides.
            Err(RetryError::Fatal(StoreError::NoSuchUpload(_))) => {
                debug!(upload_id = %upload_id, "merge upload already completed");
            }
            Err(RetryError::Cancelled) => return Err(MergeError::Cancelled),
            Err(e) => return Err(MergeError::CompleteFailed(e)),
        }

        let mut done = state.lock().await;
        done.completed = true;
        writer.publish(done.clone())?;
        Ok(copied)
    }

    async fn copy_parts(
        &self,
        dst: &ObjectPath,
        upload_id: &str,
        parts: Vec<MergePart>,
        state: &Arc<Mutex<MergeState>>,
        publisher: StatePublisher,
    ) -> Result<u32, MergeError> {
        let cancel = self.cancel.child_token();
        let slots = Arc::new(Semaphore::new(self.config.concurrency));
        let total = state.lock().await.all_parts.len() as u32;
        let mut copies = JoinSet::new();

        for part in parts {
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&slots).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let job = CopyJob {
                store: Arc::clone(&self.store),
                dst: dst.clone(),
                upload_id: upload_id.to_string(),
                retry: self.config.retry.clone(),
                cancel: cancel.clone(),
                state: Arc::clone(state),
                publisher: publisher.clone(),
                events: self.events.clone(),
                total,
            };
            copies.spawn(async move {
                let _permit = permit;
                let result = job.run(part).await;
                if result.is_err() {
                    job.cancel.cancel();
                }
                result
            });
        }

        let mut copied = 0;
        let mut failure: Option<MergeError> = None;
        while let Some(joined) = copies.join_next().await {
            match joined.unwrap_or_else(|e| Err(MergeError::Task(e.to_string()))) {
                Ok(()) => copied += 1,
                Err(e) => {
                    cancel.cancel();
                    match &failure {
                        None | Some(MergeError::Cancelled) => failure = Some(e),
                        Some(_) => {}
                    }
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None if cancel.is_cancelled() => Err(MergeError::Cancelled),
            None => Ok(copied),
        }
    }

    async fn verify(&self, dst: &ObjectPath, expected: u64) -> Result<u64, MergeError> {
        let Some(meta) = self.head(dst).await? else {
            return Err(MergeError::DestinationMissing(dst.to_string()));
        };
        if meta.size != expected {
            return Err(MergeError::SizeMismatch {
                expected,
                actual: meta.size,
            });
        }
        self.emit(MergeEvent::Verified { size: meta.size });
        info!(dst = %dst, size = %format_size(meta.size), "merged object verified");
        Ok(meta.size)
    }

    /// Deletes the parts directory. Only ever called after [`Self::verify`].
    async fn cleanup(&self, dir: &PartsDir, dst: &ObjectPath) -> Result<(), MergeError> {
        let removed =
            remove_parts_dir(self.store.as_ref(), dir, &self.config.retry, &self.cancel).await?;
        self.forget_checkpoint(dst).await?;
        self.emit(MergeEvent::CleanupDone { removed });
        info!(dir = %dir, removed, "parts directory removed");
        Ok(())
    }

    async fn forget_checkpoint(&self, dst: &ObjectPath) -> Result<(), MergeError> {
        if let Some(state_dir) = &self.config.state_dir
            && remove_checkpoint(&checkpoint_path(state_dir, dst)).await?
        {
            debug!(dst = %dst, "transfer checkpoint removed");
        }
        Ok(())
    }

    async fn head(&self, dst: &ObjectPath) -> Result<Option<ObjectMeta>, MergeError> {
        let store = self.store.as_ref();
        with_retry(&self.config.retry, &self.cancel, "head destination", |_| {
            store.head_object(dst)
        })
        .await
        .map_err(MergeError::from_retry)
    }

    async fn abort(&self, dst: &ObjectPath, upload_id: &str) {
        match self.store.abort_multipart_upload(dst, upload_id).await {
            Ok(()) | Err(StoreError::NoSuchUpload(_)) => {}
            Err(e) => warn!(upload_id, error = %e, "could not abort stale merge upload"),
        }
    }
}

fn emit(events: &Option<mpsc::Sender<MergeEvent>>, event: MergeEvent) {
    if let Some(tx) = events
        && let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(event)
    {
        trace!(?dropped, "event channel full, dropping event");
    }
}

/// Everything one copy task needs.
struct CopyJob {
    store: Arc<dyn ObjectStore>,
    dst: ObjectPath,
    upload_id: String,
    retry: RetryPolicy,
    cancel: CancellationToken,
    state: Arc<Mutex<MergeState>>,
    publisher: StatePublisher,
    events: Option<mpsc::Sender<MergeEvent>>,
    total: u32,
}

impl CopyJob {
    async fn run(&self, part: MergePart) -> Result<(), MergeError> {
        let n = part.part_number;
        let src = ObjectPath::new(self.dst.bucket.clone(), part.source_object_key);
        let store = self.store.as_ref();
        let etag = with_retry(&self.retry, &self.cancel, "copy part", |_| {
            store.upload_part_copy(&self.dst, &self.upload_id, n, &src)
        })
        .await
        .map_err(|e| match e {
            RetryError::Cancelled => MergeError::Cancelled,
            source => MergeError::CopyPartFailed { part: n, source },
        })?;

        let copied = {
            let mut state = self.state.lock().await;
            state.finished.insert(FinishedPart::new(n, &etag));
            self.publisher.publish(state.clone())?;
            state.finished.len() as u32
        };
        emit(
            &self.events,
            MergeEvent::PartCopied {
                part: n,
                copied,
                total_parts: self.total,
            },
        );
        debug!(part = n, "part copied");
        Ok(())
    }
}
