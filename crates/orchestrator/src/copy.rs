//! Copy orchestrator: transfer, then merge.
//!
//! Owns the shared cancellation token and a single event stream that
//! carries the events of both phases.

use std::sync::Arc;

use bigcopy_fetch::ChunkFetcher;
use bigcopy_merge::{MergeEngine, MergeOutcome};
use bigcopy_store::ObjectStore;
use bigcopy_transfer::{
    EVENT_CHANNEL_CAPACITY, StagingArea, TransferOutcome, TransferPipeline, UploadMode,
    validate_object_key,
};
use bigcopy_types::{ObjectPath, PartsDir};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::config::{CopyConfig, StagingKind};
use crate::types::{CopyEvent, CopyOutcome};
use crate::CopyError;

/// Copies one source into object storage across as many runs as it takes.
///
/// Every run resumes from what earlier runs left behind, so callers simply
/// call [`copy`](Self::copy) again after a suspension, an interrupt or a
/// failure.
pub struct ResumableCopy {
    store: Arc<dyn ObjectStore>,
    config: CopyConfig,
    events_tx: mpsc::Sender<CopyEvent>,
    events_rx: Option<mpsc::Receiver<CopyEvent>>,
    cancel: CancellationToken,
}

impl ResumableCopy {
    pub fn new(store: Arc<dyn ObjectStore>, config: CopyConfig) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            config,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &CopyConfig {
        &self.config
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<CopyEvent>> {
        self.events_rx.take()
    }

    /// Returns the token that cancels both phases.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancels the copy when the process receives an interrupt.
    ///
    /// The returned task ends on the first interrupt or once the token is
    /// cancelled some other way.
    pub fn cancel_on_ctrl_c(&self) -> JoinHandle<()> {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                signal = tokio::signal::ctrl_c() => match signal {
                    Ok(()) => {
                        warn!("interrupt received, stopping after in-flight parts");
                        cancel.cancel();
                    }
                    Err(e) => warn!(error = %e, "cannot listen for interrupts"),
                },
            }
        })
    }

    /// Copies the source behind `fetcher` to `dst`.
    ///
    /// In standalone mode the parts are merged once all of them exist. In
    /// native mode the transfer completes the destination itself.
    pub async fn copy(
        &self,
        fetcher: Arc<dyn ChunkFetcher>,
        dst: &ObjectPath,
    ) -> Result<CopyOutcome, CopyError> {
        let result = self.run_copy(fetcher, dst).await;
        match &result {
            Ok(CopyOutcome::Suspended {
                finished,
                remaining,
            }) => {
                info!(dst = %dst, finished, remaining, "copy suspended, run again to continue");
            }
            Ok(outcome) => {
                self.emit(CopyEvent::Completed {
                    dst: dst.to_string(),
                });
                info!(dst = %dst, outcome = ?outcome, "copy completed");
            }
            Err(CopyError::Cancelled) => {
                info!(dst = %dst, "copy cancelled, run again to resume");
            }
            Err(e) => {
                self.emit(CopyEvent::Failed {
                    dst: dst.to_string(),
                    error: e.to_string(),
                });
                error!(dst = %dst, error = %e, "copy failed");
            }
        }
        result
    }

    async fn run_copy(
        &self,
        fetcher: Arc<dyn ChunkFetcher>,
        dst: &ObjectPath,
    ) -> Result<CopyOutcome, CopyError> {
        let transfer = self.transfer(fetcher, dst).await?;
        match (self.config.upload_mode, transfer) {
            (_, TransferOutcome::Suspended { finished, remaining }) => {
                Ok(CopyOutcome::Suspended {
                    finished,
                    remaining,
                })
            }
            (UploadMode::NativeMultipart, TransferOutcome::AlreadyDone) => {
                Ok(CopyOutcome::AlreadyDone)
            }
            (UploadMode::NativeMultipart, transfer) => Ok(CopyOutcome::Copied {
                transfer,
                merge: None,
            }),
            (UploadMode::StandaloneParts, transfer) => {
                let merge = self.finish(dst).await?;
                if transfer == TransferOutcome::AlreadyDone && merge == MergeOutcome::AlreadyDone
                {
                    return Ok(CopyOutcome::AlreadyDone);
                }
                Ok(CopyOutcome::Copied {
                    transfer,
                    merge: Some(merge),
                })
            }
        }
    }

    /// Runs only the transfer phase.
    pub async fn transfer(
        &self,
        fetcher: Arc<dyn ChunkFetcher>,
        dst: &ObjectPath,
    ) -> Result<TransferOutcome, CopyError> {
        self.config.validate()?;
        let staging = self.open_staging().await?;
        let (events, forwarder) = self.forward(CopyEvent::Transfer);

        let pipeline =
            TransferPipeline::new(Arc::clone(&self.store), fetcher, self.config.transfer_config())
                .with_staging(Arc::new(staging.clone()))
                .with_events(events)
                .with_cancel(self.cancel.clone());
        let result = pipeline.run(dst).await;
        drop(pipeline);
        join_forwarder(forwarder).await;

        match staging.close().await {
            Ok(0) => {}
            Ok(purged) => debug!(purged, "staging files purged"),
            Err(e) => warn!(error = %e, "could not close staging area"),
        }
        Ok(result?)
    }

    /// Runs only the merge phase for `dst`, whose parts must all exist.
    pub async fn finish(&self, dst: &ObjectPath) -> Result<MergeOutcome, CopyError> {
        validate_object_key(&dst.key)?;
        self.config.validate()?;
        let (events, forwarder) = self.forward(CopyEvent::Merge);

        let engine = MergeEngine::new(Arc::clone(&self.store), self.config.merge_config())
            .with_events(events)
            .with_cancel(self.cancel.clone());
        let result = engine.run(&PartsDir::for_destination(dst)).await;
        drop(engine);
        join_forwarder(forwarder).await;
        Ok(result?)
    }

    async fn open_staging(&self) -> Result<StagingArea, CopyError> {
        match self.config.staging {
            StagingKind::Memory => Ok(StagingArea::memory()),
            StagingKind::Disk => Ok(StagingArea::open_disk(self.config.staging_dir()).await?),
        }
    }

    fn emit(&self, event: CopyEvent) {
        if let Err(TrySendError::Full(_)) = self.events_tx.try_send(event) {
            trace!("event channel full, dropping copy event");
        }
    }

    /// Creates a phase event channel whose events are wrapped into the copy
    /// stream. The task ends once the phase drops its sender.
    fn forward<E: Send + 'static>(
        &self,
        wrap: fn(E) -> CopyEvent,
    ) -> (mpsc::Sender<E>, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let events = self.events_tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let Err(TrySendError::Full(_)) = events.try_send(wrap(event)) {
                    trace!("event channel full, dropping phase event");
                }
            }
        });
        (tx, forwarder)
    }
}

async fn join_forwarder(forwarder: JoinHandle<()>) {
    if let Err(e) = forwarder.await {
        warn!(error = %e, "event forwarder failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bigcopy_store::MemoryStore;

    #[tokio::test]
    async fn ctrl_c_task_ends_with_the_token() {
        let copier = ResumableCopy::new(Arc::new(MemoryStore::new()), CopyConfig::default());
        let watcher = copier.cancel_on_ctrl_c();
        copier.cancel_token().cancel();
        watcher.await.unwrap();
    }

    #[tokio::test]
    async fn events_can_be_taken_once() {
        let mut copier = ResumableCopy::new(Arc::new(MemoryStore::new()), CopyConfig::default());
        assert!(copier.take_events().is_some());
        assert!(copier.take_events().is_none());
    }

    #[tokio::test]
    async fn invalid_config_fails_before_storage() {
        let store = Arc::new(MemoryStore::new());
        let config = CopyConfig {
            write_concurrency: 0,
            ..CopyConfig::default()
        };
        let copier = ResumableCopy::new(store.clone(), config);
        let dst = ObjectPath::new("bucket", "dst.bin");
        let err = copier.finish(&dst).await.unwrap_err();
        assert!(matches!(err, CopyError::Config(_)));
        assert_eq!(store.call_count(bigcopy_store::StoreOp::GetObject), 0);
    }

    #[tokio::test]
    async fn finish_rejects_bad_keys() {
        let copier = ResumableCopy::new(Arc::new(MemoryStore::new()), CopyConfig::default());
        let err = copier
            .finish(&ObjectPath::new("bucket", "a/../b"))
            .await
            .unwrap_err();
        assert!(matches!(err, CopyError::Transfer(_)));
    }
}
