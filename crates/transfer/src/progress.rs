use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::trace;

use crate::types::{PartState, TransferEvent, TransferProgress};

/// Counts finished bytes and parts and forwards events to an optional
/// listener without ever blocking the pipeline.
pub struct ProgressTracker {
    events: Option<mpsc::Sender<TransferEvent>>,
    speed: SpeedCalculator,
    total_bytes: u64,
    total_parts: u32,
    transferred: AtomicU64,
    finished: AtomicU32,
}

impl ProgressTracker {
    pub fn new(
        events: Option<mpsc::Sender<TransferEvent>>,
        total_bytes: u64,
        total_parts: u32,
    ) -> Self {
        Self {
            events,
            speed: SpeedCalculator::new(None, None),
            total_bytes,
            total_parts,
            transferred: AtomicU64::new(0),
            finished: AtomicU32::new(0),
        }
    }

    /// Starts the counters from work finished by an earlier run.
    pub fn with_baseline(self, bytes: u64, parts: u32) -> Self {
        self.transferred.store(bytes, Ordering::Relaxed);
        self.finished.store(parts, Ordering::Relaxed);
        self
    }

    /// Sends an event if a listener is attached. Drops it when the channel
    /// is full.
    pub fn emit(&self, event: TransferEvent) {
        if let Some(tx) = &self.events
            && let Err(mpsc::error::TrySendError::Full(dropped)) = tx.try_send(event)
        {
            trace!(?dropped, "event channel full, dropping event");
        }
    }

    pub fn part_state(&self, part: u32, state: PartState) {
        self.emit(TransferEvent::PartState { part, state });
    }

    /// Records a finished part and publishes the new totals.
    pub fn part_uploaded(&self, part: u32, bytes: u64) {
        self.transferred.fetch_add(bytes, Ordering::Relaxed);
        self.finished.fetch_add(1, Ordering::Relaxed);
        self.speed.add_sample(bytes);
        self.emit(TransferEvent::PartUploaded { part, bytes });
        self.emit(TransferEvent::Progress(self.snapshot()));
    }

    pub fn snapshot(&self) -> TransferProgress {
        let transferred = self.transferred.load(Ordering::Relaxed);
        TransferProgress {
            transferred_bytes: transferred,
            total_bytes: self.total_bytes,
            finished_parts: self.finished.load(Ordering::Relaxed),
            total_parts: self.total_parts,
            bytes_per_second: self.speed.bytes_per_second(),
            eta: self.speed.eta(self.total_bytes.saturating_sub(transferred)),
        }
    }
}

// ---------------------------------------------------------------------------
// SpeedCalculator
// ---------------------------------------------------------------------------

struct SpeedSample {
    bytes: u64,
    timestamp: Instant,
}

/// Transfer speed over a sliding window of samples.
pub struct SpeedCalculator {
    inner: Mutex<SpeedInner>,
}

struct SpeedInner {
    samples: Vec<SpeedSample>,
    max_samples: usize,
    window_size: Duration,
}

impl SpeedCalculator {
    /// `window_size` defaults to 30 s (parts are large and finish seldom),
    /// `max_samples` to 100.
    pub fn new(window_size: Option<Duration>, max_samples: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(SpeedInner {
                samples: Vec::new(),
                max_samples: max_samples.unwrap_or(100),
                window_size: window_size.unwrap_or(Duration::from_secs(30)),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SpeedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `bytes` finished now.
    pub fn add_sample(&self, bytes: u64) {
        let mut s = self.lock();
        let now = Instant::now();
        s.samples.push(SpeedSample {
            bytes,
            timestamp: now,
        });

        if let Some(cutoff) = now.checked_sub(s.window_size) {
            s.samples.retain(|sample| sample.timestamp >= cutoff);
        }
        if s.samples.len() > s.max_samples {
            let excess = s.samples.len() - s.max_samples;
            s.samples.drain(..excess);
        }
    }

    /// Average bytes/second inside the window; 0.0 with fewer than 2 samples.
    pub fn bytes_per_second(&self) -> f64 {
        let s = self.lock();
        let (Some(first), Some(last)) = (s.samples.first(), s.samples.last()) else {
            return 0.0;
        };
        let elapsed = last.timestamp.duration_since(first.timestamp);
        if s.samples.len() < 2 || elapsed.is_zero() {
            return 0.0;
        }
        // The first sample marks the window start; its bytes finished before it.
        let bytes: u64 = s.samples[1..].iter().map(|sample| sample.bytes).sum();
        bytes as f64 / elapsed.as_secs_f64()
    }

    /// Time left for `remaining_bytes` at the current speed.
    pub fn eta(&self, remaining_bytes: u64) -> Option<Duration> {
        let speed = self.bytes_per_second();
        if speed <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(remaining_bytes as f64 / speed))
    }
}
