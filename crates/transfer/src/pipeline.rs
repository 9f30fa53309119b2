//! The two-stage transfer engine.
//!
//! A reader stage fetches parts with at most `read_concurrency` requests in
//! flight and hands them to a queue of `queue_capacity` slots. A reader slot
//! is held until its part is queued, so at most N + Q + M parts are in
//! memory at any time. `write_concurrency` uploader tasks drain the queue,
//! upload with retries and record each part in the checkpoint before it
//! counts as done. One aggregating loop owns the terminal decision.

use std::path::PathBuf;
use std::sync::Arc;

use bigcopy_fetch::{ChunkFetcher, FetchError, SourceInfo};
use bigcopy_store::{ObjectStore, StoreError, StoreFuture};
use bigcopy_types::{
    FinishedPart, ObjectPath, PartInfo, PartPlan, PartsDir, RetryPolicy, collapse_runs,
    format_size, parse_part_name,
};
use bytes::Bytes;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::checkpoint::{
    CheckpointHandle, CheckpointRecord, SessionInfo, checkpoint_path, load_checkpoint,
    remove_checkpoint, validate_fingerprint,
};
use crate::manifest::{Manifest, list_part_objects, remove_parts_dir};
use crate::progress::ProgressTracker;
use crate::retry::{RetryError, with_retry};
use crate::staging::{StagedPart, StagingArea};
use crate::types::{
    PartState, ResumePolicy, TransferConfig, TransferEvent, TransferOutcome, UploadMode,
};
use crate::validation::validate_object_key;
use crate::TransferError;

/// Moves one source into object storage, resuming from earlier runs.
pub struct TransferPipeline {
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn ChunkFetcher>,
    staging: Arc<StagingArea>,
    config: TransferConfig,
    cancel: CancellationToken,
    events: Option<mpsc::Sender<TransferEvent>>,
}

/// Everything known about a run once the source has been described.
struct Prepared {
    dst: ObjectPath,
    source: SourceInfo,
    plan: PartPlan,
    selected: Vec<PartInfo>,
    first_part: u32,
    last_part: u32,
    session: SessionInfo,
    fingerprint: String,
    checkpoint_path: PathBuf,
}

impl Prepared {
    fn selected_bytes(&self) -> u64 {
        self.selected.iter().map(PartInfo::len).sum()
    }

    fn covers(&self, part_number: u32) -> bool {
        (self.first_part..=self.last_part).contains(&part_number)
    }
}

struct RunSummary {
    skipped: u32,
    uploaded: u32,
    bytes: u64,
    left: u32,
}

impl RunSummary {
    fn outcome(&self) -> TransferOutcome {
        if self.left > 0 {
            TransferOutcome::Suspended {
                finished: self.skipped + self.uploaded,
                remaining: self.left,
            }
        } else if self.uploaded == 0 {
            TransferOutcome::AlreadyDone
        } else if self.skipped == 0 {
            TransferOutcome::UploadedFresh {
                parts: self.uploaded,
                bytes: self.bytes,
            }
        } else {
            TransferOutcome::UploadedResume {
                uploaded: self.uploaded,
                skipped: self.skipped,
                bytes: self.bytes,
            }
        }
    }
}

impl TransferPipeline {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        fetcher: Arc<dyn ChunkFetcher>,
        config: TransferConfig,
    ) -> Self {
        Self {
            store,
            fetcher,
            staging: Arc::new(StagingArea::memory()),
            config,
            cancel: CancellationToken::new(),
            events: None,
        }
    }

    /// Uses `staging` to hold fetched parts instead of plain memory.
    pub fn with_staging(mut self, staging: Arc<StagingArea>) -> Self {
        self.staging = staging;
        self
    }

    pub fn with_events(mut self, events: mpsc::Sender<TransferEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Transfers the source to `dst`.
    ///
    /// In standalone mode the parts end up in `{dst}-parts/` with a
    /// finalized manifest, ready for merging. In native mode the multipart
    /// upload is completed and `dst` exists when this returns.
    pub async fn run(&self, dst: &ObjectPath) -> Result<TransferOutcome, TransferError> {
        validate_object_key(&dst.key)?;
        self.config.validate()?;
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let prepared = self.prepare(dst).await?;
        info!(
            dst = %dst,
            source = %prepared.source.identity,
            size = %format_size(prepared.source.size),
            chunk = %format_size(prepared.plan.chunk_size()),
            parts = prepared.selected.len(),
            mode = ?self.config.mode,
            "transfer starting"
        );
        let existing = self.resumable_checkpoint(&prepared).await?;

        let outcome = match self.config.mode {
            UploadMode::StandaloneParts => self.run_standalone(&prepared, existing).await,
            UploadMode::NativeMultipart => self.run_native(&prepared, existing).await,
        };
        match &outcome {
            Ok(o) => info!(dst = %dst, outcome = ?o, "transfer finished"),
            Err(TransferError::Cancelled) => info!(dst = %dst, "transfer cancelled"),
            Err(e) => error!(dst = %dst, error = %e, "transfer failed"),
        }
        outcome
    }

    async fn prepare(&self, dst: &ObjectPath) -> Result<Prepared, TransferError> {
        let source = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
            r = self.fetcher.describe() => r?,
        };
        let plan = PartPlan::new(source.size, self.config.chunk_size)?;
        let (first_part, last_part) = self.config.part_range.unwrap_or((1, plan.len()));
        let selected = plan.select(first_part, last_part)?.to_vec();

        let session = SessionInfo {
            source: source.identity.clone(),
            source_modified: source.modified.clone(),
            total_size: plan.total_size(),
            chunk_size: plan.chunk_size(),
            part_count: plan.len(),
            destination: dst.clone(),
            mode: self.config.mode,
            upload_id: None,
        };
        Ok(Prepared {
            dst: dst.clone(),
            fingerprint: session.fingerprint(),
            checkpoint_path: checkpoint_path(&self.config.state_dir, dst),
            source,
            plan,
            selected,
            first_part,
            last_part,
            session,
        })
    }

    /// Loads the local checkpoint if it belongs to this request. A foreign
    /// checkpoint is refused or discarded according to the resume policy.
    async fn resumable_checkpoint(
        &self,
        p: &Prepared,
    ) -> Result<Option<CheckpointRecord>, TransferError> {
        let Some(record) = load_checkpoint(&p.checkpoint_path).await? else {
            return Ok(None);
        };

        let verdict = validate_fingerprint(&record, &p.fingerprint).and_then(|()| {
            if let (Some(recorded), Some(current)) =
                (&record.session.source_modified, &p.session.source_modified)
                && recorded != current
            {
                return Err(TransferError::SourceModified {
                    recorded: recorded.clone(),
                    current: current.clone(),
                });
            }
            if record.session.mode != p.session.mode {
                return Err(TransferError::FingerprintMismatch {
                    expected: format!("{:?} session", p.session.mode),
                    found: format!("{:?} session", record.session.mode),
                });
            }
            Ok(())
        });
        let Err(err) = verdict else {
            debug!(
                path = %p.checkpoint_path.display(),
                finished = record.finished_parts.len(),
                "resuming from checkpoint"
            );
            return Ok(Some(record));
        };
        if self.config.resume_policy == ResumePolicy::Refuse {
            return Err(err);
        }

        warn!(path = %p.checkpoint_path.display(), error = %err, "discarding checkpoint");
        if let Some(upload_id) = &record.session.upload_id {
            match self
                .store
                .abort_multipart_upload(&record.session.destination, upload_id)
                .await
            {
                Ok(()) | Err(StoreError::NoSuchUpload(_)) => {}
                Err(e) => warn!(upload_id, error = %e, "could not abort stale multipart upload"),
            }
        }
        remove_checkpoint(&p.checkpoint_path).await?;
        Ok(None)
    }

    async fn run_standalone(
        &self,
        p: &Prepared,
        existing: Option<CheckpointRecord>,
    ) -> Result<TransferOutcome, TransferError> {
        let store = self.store.as_ref();
        let retry = &self.config.retry;
        let dir = PartsDir::for_destination(&p.dst);
        let found = Manifest::read(store, &dir, retry, &self.cancel).await?;
        // Parts already merged and cleaned up by an earlier run.
        if found.is_none() && existing.is_none() && self.destination_complete(p).await? {
            info!(dst = %p.dst, "destination already complete");
            return Ok(TransferOutcome::AlreadyDone);
        }
        let mut manifest = self.prepare_manifest(p, &dir, found).await?;

        // The listing is the truth about which parts exist remotely.
        let listing = list_part_objects(store, &dir, retry, &self.cancel).await?;
        let missing = manifest.remaining_part_numbers(&listing)?;
        let mut record = existing.unwrap_or_else(|| CheckpointRecord::new(p.session.clone()));
        record.finished_parts = listing
            .iter()
            .filter_map(|meta| {
                let found = parse_part_name(&meta.key)?;
                let n = found.part_number;
                (p.covers(n) && !missing.contains(&n))
                    .then(|| FinishedPart::new(n, meta.etag.as_deref().unwrap_or_default()))
            })
            .collect();

        let checkpoint =
            Arc::new(CheckpointHandle::create(p.checkpoint_path.clone(), record).await?);
        let summary = self
            .execute(p, checkpoint, UploadTarget::Standalone(dir.clone()))
            .await?;
        if summary.left > 0 {
            return Ok(summary.outcome());
        }

        if !manifest.finalized {
            manifest.finalize();
            manifest.write(store, &dir, retry, &self.cancel).await?;
            debug!(dir = %dir, "manifest finalized");
        }
        Ok(summary.outcome())
    }

    /// Checks the parts-directory manifest, creating it on first use.
    async fn prepare_manifest(
        &self,
        p: &Prepared,
        dir: &PartsDir,
        found: Option<Manifest>,
    ) -> Result<Manifest, TransferError> {
        let store = self.store.as_ref();
        let retry = &self.config.retry;

        if let Some(manifest) = found {
            manifest.check_source(&p.source)?;
            if manifest.chunk_size == p.plan.chunk_size()
                && (manifest.first_part, manifest.last_part) == (p.first_part, p.last_part)
            {
                return Ok(manifest);
            }

            let found = format!(
                "chunk size {} parts {}-{}",
                manifest.chunk_size, manifest.first_part, manifest.last_part
            );
            if self.config.resume_policy == ResumePolicy::Refuse {
                return Err(TransferError::FingerprintMismatch {
                    expected: p.fingerprint.clone(),
                    found,
                });
            }
            warn!(dir = %dir, %found, "parts directory holds another plan, starting over");
            let removed = remove_parts_dir(store, dir, retry, &self.cancel).await?;
            debug!(dir = %dir, removed, "parts directory cleared");
        }

        let manifest = Manifest::new(&p.source, &p.plan, Some((p.first_part, p.last_part)))?;
        manifest.write(store, dir, retry, &self.cancel).await?;
        Ok(manifest)
    }

    /// Whether `dst` already holds an object of the selected size.
    async fn destination_complete(&self, p: &Prepared) -> Result<bool, TransferError> {
        let store = self.store.as_ref();
        let head = with_retry(&self.config.retry, &self.cancel, "head destination", |_| {
            store.head_object(&p.dst)
        })
        .await
        .map_err(TransferError::from_retry)?;
        Ok(head.is_some_and(|meta| meta.size == p.selected_bytes()))
    }

    async fn run_native(
        &self,
        p: &Prepared,
        existing: Option<CheckpointRecord>,
    ) -> Result<TransferOutcome, TransferError> {
        let store = self.store.as_ref();
        let retry = &self.config.retry;
        let expected = p.selected_bytes();

        let mut record = match existing {
            Some(record) => record,
            None => {
                if self.destination_complete(p).await? {
                    info!(dst = %p.dst, "destination already complete");
                    return Ok(TransferOutcome::AlreadyDone);
                }
                CheckpointRecord::new(p.session.clone())
            }
        };

        let upload_id = match record.session.upload_id.clone() {
            Some(id) => id,
            None => {
                let id = with_retry(retry, &self.cancel, "create multipart upload", |_| {
                    store.create_multipart_upload(&p.dst)
                })
                .await
                .map_err(TransferError::from_retry)?;
                debug!(dst = %p.dst, upload_id = %id, "multipart upload created");
                record.session.upload_id = Some(id.clone());
                id
            }
        };
        // Persisted before any part goes out so the upload is never orphaned.
        let checkpoint =
            Arc::new(CheckpointHandle::create(p.checkpoint_path.clone(), record).await?);

        let target = UploadTarget::Native {
            dst: p.dst.clone(),
            upload_id: upload_id.clone(),
        };
        let summary = self.execute(p, Arc::clone(&checkpoint), target).await?;
        if summary.left > 0 {
            return Ok(summary.outcome());
        }

        let parts: Vec<FinishedPart> = checkpoint
            .finished()
            .await
            .sorted()
            .into_iter()
            .filter(|part| p.covers(part.part_number))
            .collect();
        let completed = with_retry(retry, &self.cancel, "complete multipart upload", |_| {
            store.complete_multipart_upload(&p.dst, &upload_id, parts.clone())
        })
        .await;
        match completed {
            Ok(()) => {}
            // An earlier run completed it; the size check below decides.
            Err(RetryError::Fatal(StoreError::NoSuchUpload(_))) => {
                debug!(upload_id = %upload_id, "multipart upload already completed");
            }
            Err(e) => return Err(TransferError::from_retry(e)),
        }

        let head = with_retry(retry, &self.cancel, "head destination", |_| {
            store.head_object(&p.dst)
        })
        .await
        .map_err(TransferError::from_retry)?;
        let actual = head.map(|meta| meta.size).unwrap_or(0);
        if actual != expected {
            return Err(TransferError::SizeMismatch { expected, actual });
        }

        remove_checkpoint(checkpoint.path()).await?;
        Ok(summary.outcome())
    }

    /// Schedules the parts not yet in the checkpoint and runs the stages.
    async fn execute(
        &self,
        p: &Prepared,
        checkpoint: Arc<CheckpointHandle>,
        target: UploadTarget,
    ) -> Result<RunSummary, TransferError> {
        let finished = checkpoint.finished().await;
        let (done, mut scheduled): (Vec<PartInfo>, Vec<PartInfo>) = p
            .selected
            .iter()
            .copied()
            .partition(|part| finished.contains(part.part_number));
        let backlog = scheduled.len();
        if let Some(max) = self.config.max_parts_per_run {
            scheduled.truncate(max as usize);
        }

        let done_numbers: Vec<u32> = done.iter().map(|part| part.part_number).collect();
        let scheduled_numbers: Vec<u32> = scheduled.iter().map(|part| part.part_number).collect();
        let tracker = Arc::new(
            ProgressTracker::new(
                self.events.clone(),
                p.selected_bytes(),
                p.selected.len() as u32,
            )
            .with_baseline(done.iter().map(PartInfo::len).sum(), done.len() as u32),
        );
        tracker.emit(TransferEvent::PlanReady {
            total_parts: p.selected.len() as u32,
            already_finished: done.len() as u32,
            scheduled: scheduled_numbers.clone(),
        });
        info!(
            dst = %p.dst,
            finished = %collapse_runs(&done_numbers),
            scheduled = %collapse_runs(&scheduled_numbers),
            deferred = backlog - scheduled.len(),
            "transfer plan ready"
        );

        let bytes = if scheduled.is_empty() {
            0
        } else {
            self.run_stages(scheduled, checkpoint, tracker, target).await?
        };
        Ok(RunSummary {
            skipped: done.len() as u32,
            uploaded: scheduled_numbers.len() as u32,
            bytes,
            left: (backlog - scheduled_numbers.len()) as u32,
        })
    }

    async fn run_stages(
        &self,
        parts: Vec<PartInfo>,
        checkpoint: Arc<CheckpointHandle>,
        tracker: Arc<ProgressTracker>,
        target: UploadTarget,
    ) -> Result<u64, TransferError> {
        let ctx = Arc::new(StageContext {
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            staging: Arc::clone(&self.staging),
            checkpoint,
            tracker,
            target,
            retry: self.config.retry.clone(),
            read_concurrency: self.config.read_concurrency,
            cancel: self.cancel.child_token(),
        });

        let (tx, rx) = mpsc::channel(self.config.queue_capacity);
        let queue = Arc::new(Mutex::new(rx));
        let mut stages = JoinSet::new();
        stages.spawn(read_stage(Arc::clone(&ctx), parts, tx));
        for _ in 0..self.config.write_concurrency {
            stages.spawn(upload_stage(Arc::clone(&ctx), Arc::clone(&queue)));
        }
        drop(queue);

        let mut uploaded = 0u64;
        let mut failure = None;
        while let Some(joined) = stages.join_next().await {
            match flatten(joined) {
                Ok(bytes) => uploaded += bytes,
                Err(e) => {
                    ctx.cancel.cancel();
                    keep_first(&mut failure, e);
                }
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(uploaded),
        }
    }
}

/// Where the uploader stage sends a part.
enum UploadTarget {
    Standalone(PartsDir),
    Native { dst: ObjectPath, upload_id: String },
}

impl UploadTarget {
    fn upload<'a>(
        &'a self,
        store: &'a dyn ObjectStore,
        part: &PartInfo,
        body: Bytes,
    ) -> StoreFuture<'a, String> {
        match self {
            Self::Standalone(dir) => {
                let path = ObjectPath::new(dir.bucket(), dir.part_key(part));
                Box::pin(async move { store.put_object(&path, body).await })
            }
            Self::Native { dst, upload_id } => {
                store.upload_part(dst, upload_id, part.part_number, body)
            }
        }
    }
}

/// State shared by every stage task of one run.
struct StageContext {
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn ChunkFetcher>,
    staging: Arc<StagingArea>,
    checkpoint: Arc<CheckpointHandle>,
    tracker: Arc<ProgressTracker>,
    target: UploadTarget,
    retry: RetryPolicy,
    read_concurrency: usize,
    cancel: CancellationToken,
}

async fn read_stage(
    ctx: Arc<StageContext>,
    parts: Vec<PartInfo>,
    tx: mpsc::Sender<StagedPart>,
) -> Result<u64, TransferError> {
    let slots = Arc::new(Semaphore::new(ctx.read_concurrency));
    let mut fetches = JoinSet::new();

    for part in parts {
        let permit = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => break,
            permit = Arc::clone(&slots).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let ctx = Arc::clone(&ctx);
        let tx = tx.clone();
        fetches.spawn(async move {
            // The slot is released only once the part sits in the queue.
            let _permit = permit;
            let result = fetch_one(&ctx, part, &tx).await;
            if let Err(e) = &result {
                if !matches!(e, TransferError::Cancelled) {
                    ctx.tracker.part_state(part.part_number, PartState::Failed);
                }
                ctx.cancel.cancel();
            }
            result
        });
    }
    drop(tx);

    let mut failure = None;
    while let Some(joined) = fetches.join_next().await {
        if let Err(e) = flatten(joined) {
            keep_first(&mut failure, e);
        }
    }
    match failure {
        Some(e) => Err(e),
        None if ctx.cancel.is_cancelled() => Err(TransferError::Cancelled),
        None => Ok(0),
    }
}

async fn fetch_one(
    ctx: &StageContext,
    part: PartInfo,
    tx: &mpsc::Sender<StagedPart>,
) -> Result<(), TransferError> {
    let n = part.part_number;
    ctx.tracker.part_state(n, PartState::Fetching);
    let data = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
        r = ctx.fetcher.fetch(part.range.start, part.len()) => r.map_err(|e| source_error(n, e))?,
    };
    let staged = ctx.staging.stage(part, data).await?;
    ctx.tracker.part_state(n, PartState::Fetched);

    tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => Err(TransferError::Cancelled),
        sent = tx.send(staged) => sent.map_err(|_| TransferError::Cancelled),
    }
}

fn source_error(part: u32, err: FetchError) -> TransferError {
    match err {
        FetchError::SizeChanged { expected, actual } => {
            TransferError::SizeChangedDuringTransfer { expected, actual }
        }
        source => TransferError::SourceUnavailable { part, source },
    }
}

async fn upload_stage(
    ctx: Arc<StageContext>,
    queue: Arc<Mutex<mpsc::Receiver<StagedPart>>>,
) -> Result<u64, TransferError> {
    let mut uploaded = 0;
    loop {
        let next = {
            let mut queue = queue.lock().await;
            tokio::select! {
                biased;
                _ = ctx.cancel.cancelled() => return Err(TransferError::Cancelled),
                next = queue.recv() => next,
            }
        };
        let Some(staged) = next else {
            return Ok(uploaded);
        };
        match upload_one(&ctx, staged).await {
            Ok(bytes) => uploaded += bytes,
            Err(e) => {
                ctx.cancel.cancel();
                return Err(e);
            }
        }
    }
}

async fn upload_one(ctx: &StageContext, staged: StagedPart) -> Result<u64, TransferError> {
    let part = *staged.part();
    let n = part.part_number;
    let len = staged.len();
    ctx.tracker.part_state(n, PartState::Uploading);

    let body = staged.bytes().await?;
    let store = ctx.store.as_ref();
    let etag = with_retry(&ctx.retry, &ctx.cancel, "upload part", |_| {
        ctx.target.upload(store, &part, body.clone())
    })
    .await
    .map_err(|e| match e {
        RetryError::Cancelled => TransferError::Cancelled,
        source => {
            ctx.tracker.part_state(n, PartState::Failed);
            TransferError::PartUploadFailed { part: n, source }
        }
    })?;
    drop(body);
    drop(staged);

    // Durable before acknowledged.
    ctx.checkpoint
        .record_finished(FinishedPart::new(n, &etag))
        .await?;
    ctx.tracker.part_state(n, PartState::Done);
    ctx.tracker.part_uploaded(n, len);
    debug!(part = n, bytes = len, "part uploaded");
    Ok(len)
}

fn flatten<T>(joined: Result<Result<T, TransferError>, JoinError>) -> Result<T, TransferError> {
    joined.unwrap_or_else(|e| Err(TransferError::Task(e.to_string())))
}

/// Keeps the first real failure; a cancellation only counts if nothing
/// else went wrong.
fn keep_first(slot: &mut Option<TransferError>, err: TransferError) {
    match slot {
        None => *slot = Some(err),
        Some(TransferError::Cancelled) if !matches!(err, TransferError::Cancelled) => {
            *slot = Some(err)
        }
        Some(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bigcopy_fetch::FetchFuture;
    use bigcopy_store::{MemoryStore, ObjectMeta, StoreOp};
    use bigcopy_types::MIB;
    use tempfile::TempDir;

    const SIZE: u64 = 23 * MIB + 17;

    struct MemFetcher {
        identity: String,
        data: Bytes,
        fail_at: Option<u64>,
        started: AtomicUsize,
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl MemFetcher {
        fn new(size: u64) -> Self {
            let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            Self {
                identity: "mem://source.bin".into(),
                data: Bytes::from(data),
                fail_at: None,
                started: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }
    }

    impl ChunkFetcher for MemFetcher {
        fn describe(&self) -> FetchFuture<'_, SourceInfo> {
            Box::pin(async move {
                Ok(SourceInfo {
                    identity: self.identity.clone(),
                    size: self.data.len() as u64,
                    modified: None,
                })
            })
        }

        fn fetch(&self, offset: u64, length: u64) -> FetchFuture<'_, Bytes> {
            Box::pin(async move {
                self.started.fetch_add(1, Ordering::SeqCst);
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);

                if self.fail_at == Some(offset) {
                    return Err(FetchError::Status {
                        status: 503,
                        range: format!("bytes={offset}-"),
                    });
                }
                let end = offset + length;
                Ok(self.data.slice(offset as usize..end as usize))
            })
        }
    }

    /// Holds every part upload until `gate` fires.
    struct StallStore {
        inner: Arc<MemoryStore>,
        gate: CancellationToken,
    }

    impl ObjectStore for StallStore {
        fn create_multipart_upload<'a>(&'a self, dst: &'a ObjectPath) -> StoreFuture<'a, String> {
            self.inner.create_multipart_upload(dst)
        }

        fn upload_part<'a>(
            &'a self,
            dst: &'a ObjectPath,
            upload_id: &'a str,
            part_number: u32,
            body: Bytes,
        ) -> StoreFuture<'a, String> {
            self.inner.upload_part(dst, upload_id, part_number, body)
        }

        fn upload_part_copy<'a>(
            &'a self,
            dst: &'a ObjectPath,
            upload_id: &'a str,
            part_number: u32,
            src: &'a ObjectPath,
        ) -> StoreFuture<'a, String> {
            self.inner.upload_part_copy(dst, upload_id, part_number, src)
        }

        fn complete_multipart_upload<'a>(
            &'a self,
            dst: &'a ObjectPath,
            upload_id: &'a str,
            parts: Vec<FinishedPart>,
        ) -> StoreFuture<'a, ()> {
            self.inner.complete_multipart_upload(dst, upload_id, parts)
        }

        fn abort_multipart_upload<'a>(
            &'a self,
            dst: &'a ObjectPath,
            upload_id: &'a str,
        ) -> StoreFuture<'a, ()> {
            self.inner.abort_multipart_upload(dst, upload_id)
        }

        fn put_object<'a>(&'a self, dst: &'a ObjectPath, body: Bytes) -> StoreFuture<'a, String> {
            Box::pin(async move {
                if dst.key.contains("/part.") {
                    self.gate.cancelled().await;
                }
                self.inner.put_object(dst, body).await
            })
        }

        fn get_object<'a>(&'a self, src: &'a ObjectPath) -> StoreFuture<'a, Option<Bytes>> {
            self.inner.get_object(src)
        }

        fn head_object<'a>(&'a self, src: &'a ObjectPath) -> StoreFuture<'a, Option<ObjectMeta>> {
            self.inner.head_object(src)
        }

        fn list_objects<'a>(
            &'a self,
            bucket: &'a str,
            prefix: &'a str,
        ) -> StoreFuture<'a, Vec<ObjectMeta>> {
            self.inner.list_objects(bucket, prefix)
        }

        fn delete_object<'a>(&'a self, path: &'a ObjectPath) -> StoreFuture<'a, ()> {
            self.inner.delete_object(path)
        }
    }

    fn config(state: &TempDir) -> TransferConfig {
        TransferConfig {
            chunk_size: 5 * MIB,
            retry: RetryPolicy::immediate(3),
            state_dir: state.path().to_path_buf(),
            ..TransferConfig::default()
        }
    }

    fn dst() -> ObjectPath {
        ObjectPath::new("bucket", "videos/source.bin")
    }

    fn assembled_parts(store: &MemoryStore, size: u64) -> Vec<u8> {
        let dir = PartsDir::for_destination(&dst());
        let plan = PartPlan::new(size, 5 * MIB).unwrap();
        let mut out = Vec::new();
        for part in plan.parts() {
            let body = store
                .object_bytes(&ObjectPath::new("bucket", dir.part_key(part)))
                .unwrap();
            out.extend_from_slice(&body);
        }
        out
    }

    #[tokio::test]
    async fn standalone_upload_writes_every_part_and_finalizes() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(MemFetcher::new(SIZE));
        let (tx, mut rx) = mpsc::channel(256);
        let cfg = TransferConfig {
            read_concurrency: 2,
            ..config(&state)
        };

        let outcome = TransferPipeline::new(store.clone(), fetcher.clone(), cfg.clone())
            .with_events(tx)
            .run(&dst())
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::UploadedFresh { parts: 5, bytes: SIZE });
        assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(assembled_parts(&store, SIZE), fetcher.data.to_vec());

        let dir = PartsDir::for_destination(&dst());
        let cancel = CancellationToken::new();
        let manifest = Manifest::read(store.as_ref(), &dir, &cfg.retry, &cancel)
            .await
            .unwrap()
            .unwrap();
        assert!(manifest.finalized);
        assert_eq!(manifest.last_part, 5);

        // Kept for the merge phase to clean up.
        let cp = checkpoint_path(state.path(), &dst());
        let record = load_checkpoint(&cp).await.unwrap().unwrap();
        assert_eq!(record.finished_parts.len(), 5);

        let mut uploaded_events = 0;
        let mut saw_plan = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                TransferEvent::PlanReady { scheduled, .. } => {
                    saw_plan = true;
                    assert_eq!(scheduled, vec![1, 2, 3, 4, 5]);
                }
                TransferEvent::PartUploaded { .. } => uploaded_events += 1,
                _ => {}
            }
        }
        assert!(saw_plan);
        assert_eq!(uploaded_events, 5);
    }

    #[tokio::test]
    async fn suspended_run_resumes_only_remaining_parts() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(MemFetcher::new(SIZE));

        let first = TransferConfig {
            max_parts_per_run: Some(2),
            ..config(&state)
        };
        let outcome = TransferPipeline::new(store.clone(), fetcher.clone(), first)
            .run(&dst())
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Suspended { finished: 2, remaining: 3 });

        store.reset_calls();
        let outcome = TransferPipeline::new(store.clone(), fetcher.clone(), config(&state))
            .run(&dst())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            TransferOutcome::UploadedResume {
                uploaded: 3,
                skipped: 2,
                bytes: SIZE - 10 * MIB
            }
        );
        // Three parts plus the finalized manifest.
        assert_eq!(store.call_count(StoreOp::PutObject), 4);
        assert_eq!(assembled_parts(&store, SIZE), fetcher.data.to_vec());

        store.reset_calls();
        let outcome = TransferPipeline::new(store.clone(), fetcher, config(&state))
            .run(&dst())
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::AlreadyDone);
        assert_eq!(store.call_count(StoreOp::PutObject), 0);
    }

    #[tokio::test]
    async fn native_mode_resumes_the_same_upload() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(MemFetcher::new(SIZE));
        let native = TransferConfig {
            mode: UploadMode::NativeMultipart,
            ..config(&state)
        };

        let outcome = TransferPipeline::new(
            store.clone(),
            fetcher.clone(),
            TransferConfig {
                max_parts_per_run: Some(3),
                ..native.clone()
            },
        )
        .run(&dst())
        .await
        .unwrap();
        assert_eq!(outcome, TransferOutcome::Suspended { finished: 3, remaining: 2 });
        assert_eq!(store.open_uploads().len(), 1);

        let outcome = TransferPipeline::new(store.clone(), fetcher.clone(), native)
            .run(&dst())
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            TransferOutcome::UploadedResume { uploaded: 2, skipped: 3, .. }
        ));
        assert_eq!(store.call_count(StoreOp::CreateMultipartUpload), 1);
        assert_eq!(store.call_count(StoreOp::UploadPart), 5);
        assert!(store.open_uploads().is_empty());
        assert_eq!(store.object_bytes(&dst()).unwrap(), fetcher.data);

        let cp = checkpoint_path(state.path(), &dst());
        assert!(!cp.exists());
    }

    #[tokio::test]
    async fn native_mode_skips_existing_destination() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(MemFetcher::new(SIZE));
        store.insert_object(&dst(), fetcher.data.clone());

        let cfg = TransferConfig {
            mode: UploadMode::NativeMultipart,
            ..config(&state)
        };
        let outcome = TransferPipeline::new(store.clone(), fetcher, cfg)
            .run(&dst())
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::AlreadyDone);
        assert_eq!(store.call_count(StoreOp::CreateMultipartUpload), 0);
    }

    #[tokio::test]
    async fn transient_upload_failures_are_retried() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.inject_failures(StoreOp::PutObject, 3);
        let fetcher = Arc::new(MemFetcher::new(SIZE));

        let outcome = TransferPipeline::new(store.clone(), fetcher, config(&state))
            .run(&dst())
            .await
            .unwrap();
        assert!(outcome.is_complete());
        // Five parts, one manifest creation, one finalize and three failures.
        assert_eq!(store.call_count(StoreOp::PutObject), 10);
    }

    #[tokio::test]
    async fn exhausted_upload_fails_the_session() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.inject_failures(StoreOp::UploadPart, 1000);
        let fetcher = Arc::new(MemFetcher::new(SIZE));
        let cfg = TransferConfig {
            mode: UploadMode::NativeMultipart,
            retry: RetryPolicy::immediate(1),
            ..config(&state)
        };

        let err = TransferPipeline::new(store.clone(), fetcher, cfg)
            .run(&dst())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::PartUploadFailed {
                source: RetryError::Exhausted { attempts: 2, .. },
                ..
            }
        ));
        // The upload id survives for the next attempt.
        let cp = checkpoint_path(state.path(), &dst());
        let record = load_checkpoint(&cp).await.unwrap().unwrap();
        assert!(record.session.upload_id.is_some());
        assert_eq!(store.open_uploads().len(), 1);
    }

    #[tokio::test]
    async fn read_failure_is_not_retried() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let mut fetcher = MemFetcher::new(SIZE);
        fetcher.fail_at = Some(5 * MIB);

        let err = TransferPipeline::new(store, Arc::new(fetcher), config(&state))
            .run(&dst())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceUnavailable { part: 2, .. }));
    }

    #[tokio::test]
    async fn foreign_checkpoint_is_refused_or_discarded() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(MemFetcher::new(SIZE));

        let mut foreign = CheckpointRecord::new(SessionInfo {
            source: "mem://another.bin".into(),
            source_modified: None,
            total_size: SIZE,
            chunk_size: 5 * MIB,
            part_count: 5,
            destination: dst(),
            mode: UploadMode::NativeMultipart,
            upload_id: Some("stale-upload".into()),
        });
        foreign.finished_parts.insert(FinishedPart::new(1, "x"));
        let cp = checkpoint_path(state.path(), &dst());
        crate::checkpoint::save_checkpoint(&cp, &foreign).await.unwrap();

        let refuse = TransferConfig {
            mode: UploadMode::NativeMultipart,
            resume_policy: ResumePolicy::Refuse,
            ..config(&state)
        };
        let err = TransferPipeline::new(store.clone(), fetcher.clone(), refuse.clone())
            .run(&dst())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FingerprintMismatch { .. }));
        assert_eq!(store.call_count(StoreOp::UploadPart), 0);

        let restart = TransferConfig {
            resume_policy: ResumePolicy::Restart,
            ..refuse
        };
        let outcome = TransferPipeline::new(store.clone(), fetcher.clone(), restart)
            .run(&dst())
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::UploadedFresh { parts: 5, bytes: SIZE });
        assert_eq!(store.call_count(StoreOp::AbortMultipartUpload), 1);
        assert_eq!(store.object_bytes(&dst()).unwrap(), fetcher.data);
    }

    #[tokio::test]
    async fn manifest_for_other_size_is_drift() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(MemFetcher::new(SIZE));
        let cancel = CancellationToken::new();
        let retry = RetryPolicy::immediate(0);

        let older = SourceInfo {
            identity: fetcher.identity.clone(),
            size: SIZE + 1,
            modified: None,
        };
        let plan = PartPlan::new(SIZE + 1, 5 * MIB).unwrap();
        Manifest::new(&older, &plan, None)
            .unwrap()
            .write(store.as_ref(), &PartsDir::for_destination(&dst()), &retry, &cancel)
            .await
            .unwrap();

        let err = TransferPipeline::new(store, fetcher, config(&state))
            .run(&dst())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::SizeChangedDuringTransfer { expected, actual }
                if expected == SIZE + 1 && actual == SIZE
        ));
    }

    #[tokio::test]
    async fn invalid_destination_and_cancelled_runs_touch_nothing() {
        let state = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let fetcher = Arc::new(MemFetcher::new(SIZE));

        let err = TransferPipeline::new(store.clone(), fetcher.clone(), config(&state))
            .run(&ObjectPath::new("bucket", "a/../b"))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::InvalidPath(_)));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = TransferPipeline::new(store.clone(), fetcher, config(&state))
            .with_cancel(cancel)
            .run(&dst())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert_eq!(store.call_count(StoreOp::PutObject), 0);
        assert_eq!(store.call_count(StoreOp::GetObject), 0);
    }

    #[tokio::test]
    async fn stalled_uploader_caps_parts_held_in_memory() {
        let state = TempDir::new().unwrap();
        let inner = Arc::new(MemoryStore::new().without_content_hashing());
        let gate = CancellationToken::new();
        let store = Arc::new(StallStore {
            inner: inner.clone(),
            gate: gate.clone(),
        });
        let size = 30 * MIB;
        let fetcher = Arc::new(MemFetcher::new(size));
        let cfg = TransferConfig {
            read_concurrency: 2,
            write_concurrency: 1,
            queue_capacity: 1,
            ..config(&state)
        };
        // One part uploading, one queued, one per read slot.
        let bound = cfg.read_concurrency + cfg.queue_capacity + cfg.write_concurrency;

        let pipeline = TransferPipeline::new(store, fetcher.clone(), cfg);
        let observe = async {
            for _ in 0..100 {
                tokio::time::sleep(Duration::from_millis(10)).await;
                assert!(fetcher.started.load(Ordering::SeqCst) <= bound);
            }
            let started = fetcher.started.load(Ordering::SeqCst);
            gate.cancel();
            started
        };
        let dst = dst();
        let (outcome, started) = tokio::join!(pipeline.run(&dst), observe);

        assert_eq!(started, bound);
        assert_eq!(
            outcome.unwrap(),
            TransferOutcome::UploadedFresh { parts: 6, bytes: size }
        );
        assert_eq!(fetcher.started.load(Ordering::SeqCst), 6);
        assert_eq!(assembled_parts(&inner, size), fetcher.data.to_vec());
    }
}
