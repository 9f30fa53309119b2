//! The `merge.json` document and the task that persists it.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bigcopy_store::ObjectStore;
use bigcopy_transfer::with_retry;
use bigcopy_types::{FinishedPart, FinishedSet, ObjectPath, RetryPolicy};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::MergeError;

/// One part object to be copied into the destination upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergePart {
    pub part_number: u32,
    pub source_object_key: String,
}

/// Progress of one server-side merge.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeState {
    pub upload_id: String,
    pub bucket: String,
    pub dst_key: String,
    /// Every part of the merge, ascending by part number.
    pub all_parts: Vec<MergePart>,
    #[serde(default)]
    pub finished: FinishedSet,
    /// Set once the multipart upload has been completed.
    #[serde(default)]
    pub completed: bool,
}

impl MergeState {
    pub fn new(upload_id: impl Into<String>, dst: &ObjectPath, mut parts: Vec<MergePart>) -> Self {
        parts.sort_by_key(|p| p.part_number);
        Self {
            upload_id: upload_id.into(),
            bucket: dst.bucket.clone(),
            dst_key: dst.key.clone(),
            all_parts: parts,
            finished: FinishedSet::new(),
            completed: false,
        }
    }

    pub fn destination(&self) -> ObjectPath {
        ObjectPath::new(self.bucket.clone(), self.dst_key.clone())
    }

    /// Whether this state describes a merge of `parts` into `dst`.
    pub fn matches(&self, dst: &ObjectPath, parts: &[MergePart]) -> bool {
        self.bucket == dst.bucket && self.dst_key == dst.key && self.all_parts == parts
    }

    /// Parts without a finished copy.
    pub fn remaining(&self) -> Vec<MergePart> {
        self.all_parts
            .iter()
            .filter(|p| !self.finished.contains(p.part_number))
            .cloned()
            .collect()
    }

    /// Part tags for completion, ascending by part number.
    pub fn completion_parts(&self) -> Vec<FinishedPart> {
        self.finished.sorted()
    }
}

#[derive(Debug)]
struct Versioned {
    version: u64,
    state: MergeState,
}

/// Publishes snapshots to a [`StateWriter`]. Cheap to clone.
#[derive(Clone)]
pub struct StatePublisher {
    snapshots: Arc<watch::Sender<Option<Versioned>>>,
    version: Arc<AtomicU64>,
}

impl StatePublisher {
    /// Hands the latest snapshot to the writer. Snapshots not yet written
    /// are replaced, so bursts collapse into one write.
    ///
    /// Callers must publish while holding the lock that guards the state,
    /// so versions follow content order.
    pub fn publish(&self, state: MergeState) -> Result<u64, MergeError> {
        if self.snapshots.is_closed() {
            return Err(MergeError::StateWriter("writer has stopped".into()));
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        self.snapshots.send_replace(Some(Versioned { version, state }));
        trace!(version, "merge state published");
        Ok(version)
    }

    fn latest(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}

/// Background task that persists merge-state snapshots as `merge.json`.
pub struct StateWriter {
    publisher: StatePublisher,
    written: watch::Receiver<u64>,
    handle: JoinHandle<Result<(), MergeError>>,
}

impl StateWriter {
    pub fn spawn(store: Arc<dyn ObjectStore>, path: ObjectPath, retry: RetryPolicy) -> Self {
        let (snapshots_tx, snapshots_rx) = watch::channel(None);
        let (written_tx, written_rx) = watch::channel(0);
        let handle = tokio::spawn(write_pump(store, path, retry, snapshots_rx, written_tx));
        Self {
            publisher: StatePublisher {
                snapshots: Arc::new(snapshots_tx),
                version: Arc::new(AtomicU64::new(0)),
            },
            written: written_rx,
            handle,
        }
    }

    pub fn publisher(&self) -> StatePublisher {
        self.publisher.clone()
    }

    pub fn publish(&self, state: MergeState) -> Result<u64, MergeError> {
        self.publisher.publish(state)
    }

    /// Waits until everything published so far has been written.
    pub async fn flush(&self) -> Result<(), MergeError> {
        let target = self.publisher.latest();
        let mut written = self.written.clone();
        written
            .wait_for(|v| *v >= target)
            .await
            .map(|_| ())
            .map_err(|_| MergeError::StateWriter("writer stopped before flushing".into()))
    }

    /// Flushes, stops the task and reports its failure, if any.
    pub async fn close(self) -> Result<(), MergeError> {
        let flushed = self.flush().await;
        drop(self.publisher);
        let stopped = self
            .handle
            .await
            .map_err(|e| MergeError::Task(e.to_string()))?;
        // The task's own error explains a failed flush better.
        stopped.and(flushed)
    }
}

async fn write_pump(
    store: Arc<dyn ObjectStore>,
    path: ObjectPath,
    retry: RetryPolicy,
    mut snapshots: watch::Receiver<Option<Versioned>>,
    written: watch::Sender<u64>,
) -> Result<(), MergeError> {
    // Never cancelled: an interrupted merge still persists its last state.
    let cancel = CancellationToken::new();
    while snapshots.changed().await.is_ok() {
        let (version, body) = {
            let latest = snapshots.borrow_and_update();
            let Some(snapshot) = latest.as_ref() else {
                continue;
            };
            (snapshot.version, Bytes::from(serde_json::to_vec_pretty(&snapshot.state)?))
        };
        with_retry(&retry, &cancel, "write merge state", |_| {
            store.put_object(&path, body.clone())
        })
        .await
        .map_err(|e| MergeError::StateWriter(e.to_string()))?;
        written.send_replace(version);
        debug!(path = %path, version, "merge state written");
    }
    Ok(())
}

/// Reads `merge.json`, `None` if it does not exist or cannot be parsed.
pub async fn load_state(
    store: &dyn ObjectStore,
    path: &ObjectPath,
    retry: &RetryPolicy,
    cancel: &CancellationToken,
) -> Result<Option<MergeState>, MergeError> {
    let data = with_retry(retry, cancel, "read merge state", |_| store.get_object(path))
        .await
        .map_err(MergeError::from_retry)?;
    let Some(data) = data else {
        return Ok(None);
    };
    match serde_json::from_slice(&data) {
        Ok(state) => Ok(Some(state)),
        Err(e) => {
            warn!(path = %path, error = %e, "ignoring unreadable merge state");
            Ok(None)
        }
    }
}
