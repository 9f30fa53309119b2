//! End-to-end copies against the in-memory store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use bigcopy_fetch::{ChunkFetcher, FetchFuture, SourceInfo};
use bigcopy_merge::{MergeError, MergeEvent, MergeOutcome};
use bigcopy_orchestrator::{
    CopyConfig, CopyError, CopyEvent, CopyOutcome, ResumableCopy, StagingKind,
};
use bigcopy_store::{MemoryStore, ObjectStore, StoreOp};
use bigcopy_transfer::{
    Manifest, ResumePolicy, TransferError, TransferEvent, TransferOutcome, UploadMode,
    checkpoint_path, list_part_objects,
};
use bigcopy_types::{MIB, ObjectPath, PartsDir, RetryPolicy};
use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Serves a shared buffer. Reads at or beyond `hold_from` wait until the
/// gate opens.
struct GatedFetcher {
    data: Bytes,
    hold_from: u64,
    gate: CancellationToken,
    fetched: Mutex<Vec<u64>>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl GatedFetcher {
    fn open(data: Bytes) -> Self {
        let fetcher = Self::gated(data, 0);
        fetcher.gate.cancel();
        fetcher
    }

    fn gated(data: Bytes, hold_from: u64) -> Self {
        Self {
            data,
            hold_from,
            gate: CancellationToken::new(),
            fetched: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn fetched_offsets(&self) -> Vec<u64> {
        let mut offsets = self.fetched.lock().unwrap().clone();
        offsets.sort_unstable();
        offsets
    }
}

impl ChunkFetcher for GatedFetcher {
    fn describe(&self) -> FetchFuture<'_, SourceInfo> {
        Box::pin(async move {
            Ok(SourceInfo {
                identity: "mem://movie.mkv".into(),
                size: self.data.len() as u64,
                modified: Some("Mon, 19 Oct 2026 08:00:00 GMT".into()),
            })
        })
    }

    fn fetch(&self, offset: u64, length: u64) -> FetchFuture<'_, Bytes> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            if offset >= self.hold_from {
                self.gate.cancelled().await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.fetched.lock().unwrap().push(offset);
            Ok(self.data.slice(offset as usize..(offset + length) as usize))
        })
    }
}

fn patterned(size: u64) -> Bytes {
    Bytes::from((0..size).map(|i| (i % 253) as u8).collect::<Vec<u8>>())
}

fn config(state: &TempDir, chunk_size: u64) -> CopyConfig {
    CopyConfig {
        chunk_size,
        max_retries: 2,
        retry_initial_delay_ms: 0,
        retry_max_delay_ms: 0,
        state_dir: state.path().to_path_buf(),
        ..CopyConfig::default()
    }
}

fn dst() -> ObjectPath {
    ObjectPath::new("media", "archive/movie.mkv")
}

fn drain(events: &mut mpsc::Receiver<CopyEvent>) -> Vec<CopyEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

async fn dst_size(store: &MemoryStore) -> Option<u64> {
    store.head_object(&dst()).await.unwrap().map(|meta| meta.size)
}

#[tokio::test]
async fn interrupted_500_mib_copy_resumes_and_merges() {
    const TOTAL: u64 = 500 * MIB;
    let chunk = 96 * MIB;
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new().without_content_hashing());
    let data = Bytes::from(vec![0u8; TOTAL as usize]);
    let retry = RetryPolicy::immediate(0);
    let cancel = CancellationToken::new();
    let dir = PartsDir::for_destination(&dst());

    // First run: parts 5 and 6 never arrive; stop once 1-4 are stored.
    let mut first = ResumableCopy::new(store.clone(), config(&state, chunk));
    let mut events = first.take_events().unwrap();
    let stop = first.cancel_token();
    let held = Arc::new(GatedFetcher::gated(data.clone(), 4 * chunk));
    let target = dst();
    let watch = async {
        let mut uploaded = 0;
        while let Some(event) = events.recv().await {
            if let CopyEvent::Transfer(TransferEvent::PartUploaded { .. }) = event {
                uploaded += 1;
                if uploaded == 4 {
                    stop.cancel();
                    break;
                }
            }
        }
    };
    let (result, ()) = tokio::join!(first.copy(held.clone(), &target), watch);
    assert!(matches!(result, Err(CopyError::Cancelled)));

    let listing = list_part_objects(store.as_ref(), &dir, &retry, &cancel)
        .await
        .unwrap();
    assert_eq!(listing.len(), 4);
    let manifest = Manifest::read(store.as_ref(), &dir, &retry, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert!(!manifest.is_transfer_complete(&listing));
    assert!(checkpoint_path(state.path(), &dst()).exists());

    // Second run uploads only what is missing.
    store.reset_calls();
    let mut second = ResumableCopy::new(store.clone(), config(&state, chunk));
    let mut events = second.take_events().unwrap();
    let fetcher = Arc::new(GatedFetcher::open(data.clone()));
    let outcome = second.transfer(fetcher.clone(), &dst()).await.unwrap();
    assert_eq!(
        outcome,
        TransferOutcome::UploadedResume {
            uploaded: 2,
            skipped: 4,
            bytes: TOTAL - 4 * chunk,
        }
    );
    assert_eq!(fetcher.fetched_offsets(), vec![4 * chunk, 5 * chunk]);

    let seen = drain(&mut events);
    let scheduled = seen.iter().find_map(|e| match e {
        CopyEvent::Transfer(TransferEvent::PlanReady { scheduled, .. }) => Some(scheduled.clone()),
        _ => None,
    });
    assert_eq!(scheduled, Some(vec![5, 6]));
    let mut uploaded: Vec<u32> = seen
        .iter()
        .filter_map(|e| match e {
            CopyEvent::Transfer(TransferEvent::PartUploaded { part, .. }) => Some(*part),
            _ => None,
        })
        .collect();
    uploaded.sort_unstable();
    assert_eq!(uploaded, vec![5, 6]);

    let listing = list_part_objects(store.as_ref(), &dir, &retry, &cancel)
        .await
        .unwrap();
    let manifest = Manifest::read(store.as_ref(), &dir, &retry, &cancel)
        .await
        .unwrap()
        .unwrap();
    assert!(manifest.finalized);
    assert!(manifest.is_transfer_complete(&listing));

    // Merge.
    store.reset_calls();
    let merged = second.finish(&dst()).await.unwrap();
    assert_eq!(
        merged,
        MergeOutcome::Merged {
            parts: 6,
            copied: 6,
            size: 524_288_000,
        }
    );
    assert_eq!(store.call_count(StoreOp::UploadPartCopy), 6);
    assert_eq!(store.call_count(StoreOp::CompleteMultipartUpload), 1);
    assert_eq!(dst_size(&store).await, Some(524_288_000));
    assert!(
        list_part_objects(store.as_ref(), &dir, &retry, &cancel)
            .await
            .unwrap()
            .is_empty()
    );
    assert!(!checkpoint_path(state.path(), &dst()).exists());
}

#[tokio::test]
async fn suspended_runs_produce_identical_bytes() {
    let size = 23 * MIB + 17;
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let data = patterned(size);
    let fetcher = Arc::new(GatedFetcher::open(data.clone()));
    let cfg = CopyConfig {
        max_parts_per_run: Some(2),
        read_concurrency: 2,
        ..config(&state, 5 * MIB)
    };
    let copier = ResumableCopy::new(store.clone(), cfg);

    let outcome = copier.copy(fetcher.clone(), &dst()).await.unwrap();
    assert_eq!(
        outcome,
        CopyOutcome::Suspended {
            finished: 2,
            remaining: 3,
        }
    );
    assert!(fetcher.peak.load(Ordering::SeqCst) <= 2);
    assert!(dst_size(&store).await.is_none());

    // The merge refuses to run over a partial transfer.
    let err = copier.finish(&dst()).await.unwrap_err();
    assert!(matches!(
        err,
        CopyError::Merge(MergeError::TransferIncomplete { count: 3, .. })
    ));

    let outcome = copier.copy(fetcher.clone(), &dst()).await.unwrap();
    assert_eq!(
        outcome,
        CopyOutcome::Suspended {
            finished: 4,
            remaining: 1,
        }
    );

    let outcome = copier.copy(fetcher.clone(), &dst()).await.unwrap();
    assert_eq!(
        outcome,
        CopyOutcome::Copied {
            transfer: TransferOutcome::UploadedResume {
                uploaded: 1,
                skipped: 4,
                bytes: 3 * MIB + 17,
            },
            merge: Some(MergeOutcome::Merged {
                parts: 5,
                copied: 5,
                size,
            }),
        }
    );
    assert_eq!(store.object_bytes(&dst()).unwrap(), data);
    assert!(store.open_uploads().is_empty());
}

#[tokio::test]
async fn finished_copy_is_not_repeated() {
    let size = 12 * MIB + 5;
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(GatedFetcher::open(patterned(size)));
    let copier = ResumableCopy::new(store.clone(), config(&state, 5 * MIB));

    let outcome = copier.copy(fetcher.clone(), &dst()).await.unwrap();
    assert!(matches!(outcome, CopyOutcome::Copied { merge: Some(_), .. }));

    store.reset_calls();
    let again = copier.copy(fetcher.clone(), &dst()).await.unwrap();
    assert_eq!(again, CopyOutcome::AlreadyDone);
    assert_eq!(store.call_count(StoreOp::PutObject), 0);
    assert_eq!(store.call_count(StoreOp::UploadPartCopy), 0);
    assert_eq!(store.call_count(StoreOp::CreateMultipartUpload), 0);

    assert_eq!(copier.finish(&dst()).await.unwrap(), MergeOutcome::AlreadyDone);
    assert_eq!(dst_size(&store).await, Some(size));
}

#[tokio::test]
async fn changed_chunk_size_discards_native_checkpoint() {
    let size = 23 * MIB + 17;
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let data = patterned(size);
    let fetcher = Arc::new(GatedFetcher::open(data.clone()));

    let native = CopyConfig {
        upload_mode: UploadMode::NativeMultipart,
        ..config(&state, 5 * MIB)
    };
    let first = ResumableCopy::new(
        store.clone(),
        CopyConfig {
            max_parts_per_run: Some(2),
            ..native.clone()
        },
    );
    let outcome = first.copy(fetcher.clone(), &dst()).await.unwrap();
    assert_eq!(
        outcome,
        CopyOutcome::Suspended {
            finished: 2,
            remaining: 3,
        }
    );
    let stale = store.open_uploads();
    assert_eq!(stale.len(), 1);

    store.reset_calls();
    let second = ResumableCopy::new(
        store.clone(),
        CopyConfig {
            chunk_size: 6 * MIB,
            ..native
        },
    );
    let outcome = second.copy(fetcher.clone(), &dst()).await.unwrap();
    assert_eq!(
        outcome,
        CopyOutcome::Copied {
            transfer: TransferOutcome::UploadedFresh { parts: 4, bytes: size },
            merge: None,
        }
    );
    assert_eq!(store.call_count(StoreOp::AbortMultipartUpload), 1);
    assert_eq!(store.call_count(StoreOp::UploadPart), 4);
    assert!(store.open_uploads().is_empty());
    assert_eq!(store.object_bytes(&dst()).unwrap(), data);
    assert!(!checkpoint_path(state.path(), &dst()).exists());
}

#[tokio::test]
async fn refuse_policy_reports_mismatch() {
    let size = 23 * MIB + 17;
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(GatedFetcher::open(patterned(size)));

    let first = ResumableCopy::new(
        store.clone(),
        CopyConfig {
            upload_mode: UploadMode::NativeMultipart,
            max_parts_per_run: Some(1),
            ..config(&state, 5 * MIB)
        },
    );
    first.copy(fetcher.clone(), &dst()).await.unwrap();

    let mut second = ResumableCopy::new(
        store.clone(),
        CopyConfig {
            upload_mode: UploadMode::NativeMultipart,
            resume_policy: ResumePolicy::Refuse,
            ..config(&state, 6 * MIB)
        },
    );
    let mut events = second.take_events().unwrap();
    let err = second.copy(fetcher, &dst()).await.unwrap_err();
    assert!(matches!(
        err,
        CopyError::Transfer(TransferError::FingerprintMismatch { .. })
    ));
    assert!(
        drain(&mut events)
            .iter()
            .any(|e| matches!(e, CopyEvent::Failed { .. }))
    );
    // Nothing was thrown away.
    assert_eq!(store.open_uploads().len(), 1);
    assert!(checkpoint_path(state.path(), &dst()).exists());
}

#[tokio::test]
async fn disk_staging_leaves_no_files() {
    let size = 11 * MIB;
    let state = TempDir::new().unwrap();
    let staging = TempDir::new().unwrap();
    std::fs::write(staging.path().join("leftover.chunk"), b"stale").unwrap();
    let store = Arc::new(MemoryStore::new());
    let data = patterned(size);
    let fetcher = Arc::new(GatedFetcher::open(data.clone()));
    let mut copier = ResumableCopy::new(
        store.clone(),
        CopyConfig {
            staging: StagingKind::Disk,
            staging_dir: Some(staging.path().to_path_buf()),
            ..config(&state, 5 * MIB)
        },
    );
    let mut events = copier.take_events().unwrap();

    let outcome = copier.copy(fetcher, &dst()).await.unwrap();
    assert!(matches!(outcome, CopyOutcome::Copied { .. }));
    assert_eq!(store.object_bytes(&dst()).unwrap(), data);
    assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);

    let seen = drain(&mut events);
    assert!(seen.iter().any(|e| matches!(e, CopyEvent::Merge(MergeEvent::Verified { .. }))));
    assert!(matches!(seen.last(), Some(CopyEvent::Completed { .. })));
}

#[tokio::test]
async fn cancelled_copy_touches_nothing() {
    let state = TempDir::new().unwrap();
    let store = Arc::new(MemoryStore::new());
    let fetcher = Arc::new(GatedFetcher::open(patterned(6 * MIB)));
    let copier = ResumableCopy::new(store.clone(), config(&state, 5 * MIB));
    copier.cancel_token().cancel();

    let err = copier.copy(fetcher, &dst()).await.unwrap_err();
    assert!(matches!(err, CopyError::Cancelled));
    assert_eq!(store.call_count(StoreOp::PutObject), 0);
}
