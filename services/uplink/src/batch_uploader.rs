//! Batching of admitted frames into single analysis requests.
//!
//! Frames accumulate in a [`BatchBuffer`] until either the count trigger
//! (`batch_size` frames buffered) or the time trigger (`max_wait` elapsed
//! since the last drain started) fires. A fallback timer guarantees that a
//! non-empty buffer is drained even if no further frames arrive.
//!
//! At most one transmission is in flight per uploader. A drain attempted
//! while another is outstanding is a no-op and returns an empty result.
//! Frames of a failed transmission are handed back in the error and are not
//! re-queued.

use crate::config::BatchConfig;
use crate::frame::{Frame, FrameResult};
use crate::transport::{AnalysisTransport, TransportError};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Errors surfaced by a drain.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The batch could not be delivered. The frames are returned so the
    /// caller can decide whether to resubmit them.
    #[error("Batch of {} frames failed: {source}", .frames.len())]
    Transmission {
        frames: Vec<Frame>,
        #[source]
        source: TransportError,
    },
}

/// Uploader thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploaderSettings {
    pub batch_size: usize,
    pub max_wait: Duration,
}

impl Default for UploaderSettings {
    fn default() -> Self {
        Self {
            batch_size: 5,
            max_wait: Duration::from_millis(15_000),
        }
    }
}

impl From<&BatchConfig> for UploaderSettings {
    fn from(config: &BatchConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            max_wait: config.max_wait(),
        }
    }
}

/// Ordered frame buffer with the drain clock.
#[derive(Debug)]
pub struct BatchBuffer {
    frames: Vec<Frame>,
    last_drain: Instant,
}

impl BatchBuffer {
    pub fn new() -> Self {
        Self {
            frames: Vec::new(),
            last_drain: Instant::now(),
        }
    }

    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Time since the last drain started (or since creation).
    pub fn since_last_drain(&self) -> Duration {
        self.last_drain.elapsed()
    }

    /// Whether the count or time trigger fires.
    pub fn is_due(&self, settings: &UploaderSettings) -> bool {
        self.frames.len() >= settings.batch_size || self.since_last_drain() > settings.max_wait
    }

    /// Swap out all buffered frames and restart the drain clock.
    pub fn take(&mut self) -> Vec<Frame> {
        self.last_drain = Instant::now();
        std::mem::take(&mut self.frames)
    }

    /// Drop all buffered frames and restart the drain clock.
    pub fn clear(&mut self) -> usize {
        self.take().len()
    }
}

impl Default for BatchBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the uploader state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploaderStatus {
    pub buffered: usize,
    pub in_flight: bool,
    pub timer_armed: bool,
    pub since_last_drain: Duration,
    pub batch_size: usize,
    pub max_wait: Duration,
}

/// Outcome of a drain started by the fallback timer.
#[derive(Debug)]
pub struct BackgroundDrain {
    pub frames: usize,
    pub outcome: Result<Vec<FrameResult>, UploadError>,
}

struct FallbackTimer {
    id: u64,
    handle: JoinHandle<()>,
}

struct UploadState {
    buffer: BatchBuffer,
    in_flight: bool,
    timer: Option<FallbackTimer>,
    /// Bumped by `reset()`; transmissions from an older epoch do not touch
    /// the in-flight flag.
    epoch: u64,
    next_timer_id: u64,
}

struct Batch {
    frames: Vec<Frame>,
    epoch: u64,
}

struct Shared {
    settings: UploaderSettings,
    transport: Arc<dyn AnalysisTransport>,
    state: Mutex<UploadState>,
    background: Option<mpsc::UnboundedSender<BackgroundDrain>>,
}

/// Clears the in-flight flag when a transmission ends, including when the
/// awaiting future is dropped.
struct InFlightGuard<'a> {
    shared: &'a Arc<Shared>,
    epoch: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if state.epoch == self.epoch {
            state.in_flight = false;
        }
        // Frames added during the transmission still need a deadline.
        self.shared.arm_timer(&mut state);
    }
}

impl Shared {
    /// Start a drain if none is in flight and there is something to send.
    fn begin_drain(&self, state: &mut UploadState) -> Option<Batch> {
        if state.in_flight || state.buffer.is_empty() {
            return None;
        }

        state.in_flight = true;
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }

        Some(Batch {
            frames: state.buffer.take(),
            epoch: state.epoch,
        })
    }

    fn arm_timer(self: &Arc<Self>, state: &mut UploadState) {
        if state.timer.is_some() || state.buffer.is_empty() {
            return;
        }

        let runtime = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("No async runtime, fallback timer not armed");
                return;
            }
        };

        state.next_timer_id += 1;
        let id = state.next_timer_id;
        let wait = self.settings.max_wait;
        let shared = Arc::downgrade(self);

        let handle = runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            fire_timer(shared, id).await;
        });

        debug!(timer_id = id, wait_ms = wait.as_millis() as u64, "Fallback timer armed");
        state.timer = Some(FallbackTimer { id, handle });
    }

    async fn transmit(self: &Arc<Self>, batch: Batch) -> Result<Vec<FrameResult>, UploadError> {
        let _guard = InFlightGuard {
            shared: self,
            epoch: batch.epoch,
        };

        let count = batch.frames.len();
        info!(frames = count, "Transmitting batch");

        match self.transport.analyze_batch(&batch.frames).await {
            Ok(results) => {
                info!(frames = count, results = results.len(), "Batch delivered");
                Ok(results)
            }
            Err(e) => {
                error!(frames = count, error = %e, "Batch transmission failed");
                Err(UploadError::Transmission {
                    frames: batch.frames,
                    source: e,
                })
            }
        }
    }
}

async fn fire_timer(shared: Weak<Shared>, id: u64) {
    let Some(shared) = shared.upgrade() else {
        return;
    };

    let batch = {
        let mut state = shared.state.lock();
        let current = state.timer.as_ref().map_or(false, |timer| timer.id == id);
        if !current {
            return;
        }
        state.timer = None;
        shared.begin_drain(&mut state)
    };

    let Some(batch) = batch else {
        debug!(timer_id = id, "Fallback timer fired with nothing to drain");
        return;
    };

    let frames = batch.frames.len();
    debug!(timer_id = id, frames, "Fallback timer draining buffer");
    let outcome = shared.transmit(batch).await;

    if let Some(sink) = &shared.background {
        if sink.send(BackgroundDrain { frames, outcome }).is_err() {
            debug!("Background drain receiver dropped");
        }
    }
}

/// Accumulates frames and transmits them as batches.
///
/// Cloning yields another handle to the same uploader.
#[derive(Clone)]
pub struct BatchUploader {
    shared: Arc<Shared>,
}

impl BatchUploader {
    pub fn new(transport: Arc<dyn AnalysisTransport>, settings: UploaderSettings) -> Self {
        Self::build(transport, settings, None)
    }

    /// Like [`BatchUploader::new`], forwarding the outcome of timer-driven
    /// drains to `sink`.
    pub fn with_background_sink(
        transport: Arc<dyn AnalysisTransport>,
        settings: UploaderSettings,
        sink: mpsc::UnboundedSender<BackgroundDrain>,
    ) -> Self {
        Self::build(transport, settings, Some(sink))
    }

    fn build(
        transport: Arc<dyn AnalysisTransport>,
        settings: UploaderSettings,
        background: Option<mpsc::UnboundedSender<BackgroundDrain>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                transport,
                state: Mutex::new(UploadState {
                    buffer: BatchBuffer::new(),
                    in_flight: false,
                    timer: None,
                    epoch: 0,
                    next_timer_id: 0,
                }),
                background,
            }),
        }
    }

    pub fn settings(&self) -> UploaderSettings {
        self.shared.settings
    }

    /// Buffer a frame.
    ///
    /// Returns `Some(results)` when this call triggered and completed a
    /// drain, `None` when the frame was only buffered.
    pub async fn add(&self, frame: Frame) -> Result<Option<Vec<FrameResult>>, UploadError> {
        let batch = {
            let mut state = self.shared.state.lock();
            state.buffer.push(frame);

            let due = state.buffer.is_due(&self.shared.settings);
            let batch = if due { self.shared.begin_drain(&mut state) } else { None };

            if batch.is_none() {
                if due {
                    debug!(
                        buffered = state.buffer.len(),
                        "Batch due while a transmission is in flight, deferring"
                    );
                }
                self.shared.arm_timer(&mut state);
            }
            batch
        };

        match batch {
            Some(batch) => self.shared.transmit(batch).await.map(Some),
            None => Ok(None),
        }
    }

    /// Drain the buffer now if nothing is in flight.
    ///
    /// Returns an empty result when the buffer is empty or another
    /// transmission is outstanding.
    pub async fn drain(&self) -> Result<Vec<FrameResult>, UploadError> {
        let batch = {
            let mut state = self.shared.state.lock();
            self.shared.begin_drain(&mut state)
        };

        match batch {
            Some(batch) => self.shared.transmit(batch).await,
            None => Ok(Vec::new()),
        }
    }

    /// Force a drain regardless of the triggers.
    pub async fn flush(&self) -> Result<Vec<FrameResult>, UploadError> {
        self.drain().await
    }

    /// Discard buffered frames without sending them and clear all state.
    pub fn reset(&self) {
        let mut state = self.shared.state.lock();
        if let Some(timer) = state.timer.take() {
            timer.handle.abort();
        }
        let discarded = state.buffer.clear();
        state.in_flight = false;
        state.epoch += 1;

        info!(discarded, "Batch uploader reset");
    }

    pub fn status(&self) -> UploaderStatus {
        let state = self.shared.state.lock();
        UploaderStatus {
            buffered: state.buffer.len(),
            in_flight: state.in_flight,
            timer_armed: state.timer.is_some(),
            since_last_drain: state.buffer.since_last_drain(),
            batch_size: self.shared.settings.batch_size,
            max_wait: self.shared.settings.max_wait,
        }
    }
}

impl std::fmt::Debug for BatchUploader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchUploader")
            .field("settings", &self.shared.settings)
            .field("status", &self.status())
            .finish()
    }
}
