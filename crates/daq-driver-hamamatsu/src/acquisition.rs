//! Image acquisition loop.
//!
//! RemoteEx announces each new ring-buffer image with an unsolicited
//! `Livemonitor` message. A single task consumes these notifications, fetches
//! the image (and, while sweeping, the time scaling table) over the data
//! socket and broadcasts [`ImageRecord`]s.
//!
//! # States
//!
//! ```text
//!              start (free-running)
//!   Idle ─────────────────────────────▶ FreeRunning
//!    │ ▲                                    │
//!    │ └────────────── stop ────────────────┘
//!    │ start (gated)
//!    ▼
//!   EventGatedWaiting ──trigger + AcqStart(SingleLive)──▶ EventGatedCapturing
//!          ▲                                                     │
//!          └──────────── image delivered or timed out ───────────┘
//! ```
//!
//! In free-running mode only the newest pending notification is served, so a
//! slow consumer skips images rather than falling behind. In gated mode every
//! trigger produces exactly one single-shot acquisition; triggers that arrive
//! while capturing are queued. Triggers fired while the stream is stopped are
//! discarded. A trigger whose acquisition cannot be started is retried every
//! [`TRIGGER_RETRY_DELAY`] and dropped after [`TRIGGER_START_ATTEMPTS`]
//! failures.

use chrono::Utc;
use daq_core::{Frame, ImageRecord, Metadata};
use parking_lot::Mutex as SyncMutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{instrument, Instrument};

use crate::commands::AcqMode;
use crate::connection::DataChannel;
use crate::error::{RemoteExError, RxResult};
use crate::invoker::CommandInvoker;
use crate::metadata;
use crate::router::ImageNotification;

/// Capacity of the image broadcast channel.
pub const IMAGE_CHANNEL_CAPACITY: usize = 16;

/// Ring buffer size requested from RemoteEx.
pub const DEFAULT_RING_BUFFERS: u32 = 3;

/// Shortest wait for a triggered image.
pub const MIN_FRAME_TIMEOUT: Duration = Duration::from_secs(1);

/// Busy time after which a still running acquisition is stopped before a
/// triggered start.
pub const BUSY_STOP_AFTER: Duration = Duration::from_secs(2);

/// Stops issued while waiting for an idle device before starting anyway.
pub const BUSY_STOP_ATTEMPTS: u32 = 3;

/// Delay before retrying a triggered start that failed.
pub const TRIGGER_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Failed starts after which a queued trigger is dropped.
pub const TRIGGER_START_ATTEMPTS: u32 = 3;

/// How long `terminate` waits for the acquisition task.
pub const TASK_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Acquisition state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionState {
    /// Not acquiring.
    Idle,
    /// Continuous live acquisition.
    FreeRunning,
    /// Bound to a trigger, waiting for the next event.
    EventGatedWaiting,
    /// A triggered single-shot acquisition is in flight.
    EventGatedCapturing,
}

/// Software event source an acquisition can be synchronised on.
///
/// Clones fire the same event.
#[derive(Debug, Clone)]
pub struct SoftwareTrigger {
    inner: Arc<broadcast::Sender<()>>,
}

impl Default for SoftwareTrigger {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftwareTrigger {
    /// New event source.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { inner: Arc::new(tx) }
    }

    /// Fire the event. Returns the number of listeners.
    pub fn fire(&self) -> usize {
        self.inner.send(()).unwrap_or(0)
    }

    /// Listen for events.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.inner.subscribe()
    }

    /// Whether both handles fire the same event.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Settings the acquisition loop reads for every image.
pub trait FrameContext: Send + Sync + 'static {
    /// Metadata for the next image, already merged with upstream devices.
    fn frame_metadata(&self) -> Metadata;

    /// Current exposure time (s).
    fn exposure_time(&self) -> f64;

    /// Whether the streak unit is sweeping, so a scaling table exists.
    fn streak_mode(&self) -> bool;

    /// Unit of the scaling table values (s).
    fn time_scale_factor(&self) -> f64;
}

struct Shared {
    state: watch::Sender<AcquisitionState>,
    gated: AtomicBool,
    /// Set by `start`, cleared by `stop`. Triggers only count while set.
    started: AtomicBool,
    events: SyncMutex<VecDeque<Instant>>,
}

impl Shared {
    fn set_state(&self, state: AcquisitionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::debug!("Acquisition state {:?} -> {:?}", previous, state);
        }
    }
}

#[derive(Default)]
struct Control {
    task: Option<JoinHandle<()>>,
    notifications: Option<mpsc::UnboundedReceiver<ImageNotification>>,
    trigger: Option<SoftwareTrigger>,
    forwarder: Option<JoinHandle<()>>,
}

/// Owner of the acquisition task of one readout camera.
pub struct AcquisitionEngine {
    invoker: Arc<CommandInvoker>,
    context: Arc<dyn FrameContext>,
    notify_tx: mpsc::UnboundedSender<ImageNotification>,
    control: Mutex<Control>,
    shared: Arc<Shared>,
    images: broadcast::Sender<Arc<ImageRecord>>,
    frame_count: Arc<AtomicU64>,
    ring_buffers: u32,
}

impl std::fmt::Debug for AcquisitionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcquisitionEngine")
            .field("state", &self.state())
            .field("frame_count", &self.frame_count())
            .field("ring_buffers", &self.ring_buffers)
            .finish()
    }
}

impl AcquisitionEngine {
    /// Take over the image-notification queue of `invoker`.
    pub fn new(
        invoker: Arc<CommandInvoker>,
        context: Arc<dyn FrameContext>,
        ring_buffers: u32,
    ) -> RxResult<Self> {
        let notifications = invoker.take_image_notifications().ok_or_else(|| {
            RemoteExError::NotReady("image notifications are already consumed".into())
        })?;
        let (state, _) = watch::channel(AcquisitionState::Idle);
        let (images, _) = broadcast::channel(IMAGE_CHANNEL_CAPACITY);
        Ok(Self {
            notify_tx: invoker.image_sender(),
            invoker,
            context,
            control: Mutex::new(Control {
                notifications: Some(notifications),
                ..Control::default()
            }),
            shared: Arc::new(Shared {
                state,
                gated: AtomicBool::new(false),
                started: AtomicBool::new(false),
                events: SyncMutex::new(VecDeque::new()),
            }),
            images,
            frame_count: Arc::new(AtomicU64::new(0)),
            ring_buffers,
        })
    }

    /// Current state.
    pub fn state(&self) -> AcquisitionState {
        *self.shared.state.borrow()
    }

    /// Watch state transitions.
    pub fn state_receiver(&self) -> watch::Receiver<AcquisitionState> {
        self.shared.state.subscribe()
    }

    /// Whether an acquisition is running (free or gated).
    pub fn is_active(&self) -> bool {
        self.state() != AcquisitionState::Idle
    }

    /// Whether acquisitions are gated on a trigger.
    pub fn is_gated(&self) -> bool {
        self.shared.gated.load(Ordering::SeqCst)
    }

    /// Receive every image delivered from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ImageRecord>> {
        self.images.subscribe()
    }

    /// Number of image subscribers.
    pub fn receiver_count(&self) -> usize {
        self.images.receiver_count()
    }

    /// Images delivered so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::SeqCst)
    }

    /// Start acquiring: live mode when free-running, otherwise wait for
    /// triggers. The acquisition task is started on first use, after the
    /// RemoteEx ring buffer is set up.
    #[instrument(skip(self), err)]
    pub async fn start(&self) -> RxResult<()> {
        let mut control = self.control.lock().await;
        if control.task.is_none() {
            let notifications = control.notifications.take().ok_or_else(|| {
                RemoteExError::NotReady("acquisition task was terminated".into())
            })?;
            if let Err(e) = self
                .invoker
                .acq_live_monitor_ring_buffer(self.ring_buffers)
                .await
            {
                control.notifications = Some(notifications);
                return Err(e);
            }
            let image_loop = ImageLoop {
                invoker: self.invoker.clone(),
                data: self.invoker.data_channel(),
                context: self.context.clone(),
                notifications,
                shared: self.shared.clone(),
                images: self.images.clone(),
                frame_count: self.frame_count.clone(),
            };
            control.task = Some(tokio::spawn(image_loop.run().in_current_span()));
        }

        self.shared.events.lock().clear();
        if self.is_gated() {
            self.shared.started.store(true, Ordering::SeqCst);
            self.shared.set_state(AcquisitionState::EventGatedWaiting);
        } else {
            self.invoker.start_acquisition(AcqMode::Live).await?;
            self.shared.started.store(true, Ordering::SeqCst);
            self.shared.set_state(AcquisitionState::FreeRunning);
        }
        Ok(())
    }

    /// Stop acquiring and discard pending notifications. A no-op when idle.
    #[instrument(skip(self), err)]
    pub async fn stop(&self) -> RxResult<()> {
        self.shared.started.store(false, Ordering::SeqCst);
        if self.state() == AcquisitionState::Idle {
            return Ok(());
        }
        let result = self.invoker.acq_stop(Duration::from_secs(1)).await;
        let _ = self.notify_tx.send(ImageNotification::Flush);
        self.shared.events.lock().clear();
        self.shared.set_state(AcquisitionState::Idle);
        result
    }

    /// Gate acquisitions on `trigger`, or run free with `None`.
    ///
    /// Only one trigger is followed at a time; binding a new one releases the
    /// previous one first. Binding the same trigger again does nothing.
    pub async fn synchronize(&self, trigger: Option<SoftwareTrigger>) {
        let mut control = self.control.lock().await;
        let unchanged = match (&control.trigger, &trigger) {
            (None, None) => true,
            (Some(current), Some(new)) => current.same_as(new),
            _ => false,
        };
        if unchanged {
            return;
        }

        if let Some(forwarder) = control.forwarder.take() {
            forwarder.abort();
        }
        control.trigger = trigger.clone();

        let Some(trigger) = trigger else {
            self.shared.gated.store(false, Ordering::SeqCst);
            if self.is_active() {
                tracing::info!("Synchronization removed, restart the stream for live mode");
                if let Err(e) = self.stop().await {
                    tracing::warn!("Failed to stop the triggered acquisition: {}", e);
                }
            }
            return;
        };

        self.shared.gated.store(true, Ordering::SeqCst);
        if self.state() == AcquisitionState::FreeRunning {
            // the live acquisition is stopped before the first triggered start
            self.shared.set_state(AcquisitionState::EventGatedWaiting);
        }
        let mut events = trigger.subscribe();
        let shared = self.shared.clone();
        let notify = self.notify_tx.clone();
        control.forwarder = Some(tokio::spawn(async move {
            loop {
                let fired = match events.recv().await {
                    Ok(()) => 1,
                    Err(broadcast::error::RecvError::Lagged(missed)) => missed,
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if !shared.started.load(Ordering::SeqCst) {
                    tracing::debug!("Acquisition is stopped, ignoring {} event(s).", fired);
                    continue;
                }
                for _ in 0..fired {
                    tracing::debug!("Event triggered to start a new synchronized acquisition.");
                    shared.events.lock().push_back(Instant::now());
                    let _ = notify.send(ImageNotification::Start);
                }
            }
        }));
    }

    /// Stop acquiring, end the acquisition task and release the trigger.
    pub async fn terminate(&self) {
        if let Err(e) = self.stop().await {
            tracing::debug!("Stopping acquisition during terminate failed: {}", e);
        }
        let _ = self.notify_tx.send(ImageNotification::EndOfStream);

        let mut control = self.control.lock().await;
        if let Some(forwarder) = control.forwarder.take() {
            forwarder.abort();
        }
        control.trigger = None;
        self.shared.gated.store(false, Ordering::SeqCst);

        if let Some(mut task) = control.task.take() {
            if tokio::time::timeout(TASK_JOIN_TIMEOUT, &mut task).await.is_err() {
                tracing::warn!("Acquisition task did not end, aborting it");
                task.abort();
            }
        }
    }
}

/// Outcome of a triggered start attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TriggerStart {
    Started,
    NoEvent,
    /// The device could not be started; the event stays queued.
    Failed,
}

struct ImageLoop {
    invoker: Arc<CommandInvoker>,
    data: Arc<DataChannel>,
    context: Arc<dyn FrameContext>,
    notifications: mpsc::UnboundedReceiver<ImageNotification>,
    shared: Arc<Shared>,
    images: broadcast::Sender<Arc<ImageRecord>>,
    frame_count: Arc<AtomicU64>,
}

impl ImageLoop {
    async fn run(mut self) {
        tracing::debug!("Starting data task.");
        let mut capturing = false;
        let mut failed_starts = 0u32;
        let mut time_list: Option<Vec<f64>> = None;

        loop {
            let gated = self.shared.gated.load(Ordering::SeqCst);
            let mut retry_pending = false;
            if gated && !capturing {
                match self.start_triggered().await {
                    TriggerStart::Started => {
                        capturing = true;
                        failed_starts = 0;
                    }
                    TriggerStart::NoEvent => failed_starts = 0,
                    TriggerStart::Failed => {
                        failed_starts += 1;
                        if failed_starts >= TRIGGER_START_ATTEMPTS {
                            if self.shared.events.lock().pop_front().is_some() {
                                tracing::error!(
                                    "Dropping trigger after {} failed acquisition starts.",
                                    failed_starts
                                );
                            }
                            failed_starts = 0;
                        }
                        retry_pending = !self.shared.events.lock().is_empty();
                    }
                }
            }

            let received = if gated && capturing {
                let wait = Duration::try_from_secs_f64(self.context.exposure_time() * 2.0)
                    .unwrap_or(MIN_FRAME_TIMEOUT)
                    .max(MIN_FRAME_TIMEOUT);
                match tokio::time::timeout(wait, self.notifications.recv()).await {
                    Ok(received) => received,
                    Err(_) => {
                        tracing::warn!(
                            "Failed to receive image from streak ccd. Timed out after {:?}. Will \
                             try again.",
                            wait
                        );
                        capturing = false;
                        self.set_waiting();
                        continue;
                    }
                }
            } else if retry_pending {
                match tokio::time::timeout(TRIGGER_RETRY_DELAY, self.notifications.recv()).await {
                    Ok(received) => received,
                    Err(_) => continue,
                }
            } else {
                self.notifications.recv().await
            };

            let Some(mut notification) = received else {
                break;
            };
            tracing::debug!("Received img message {:?}", notification);

            if !gated {
                // serve only the newest image
                while let Ok(next) = self.notifications.try_recv() {
                    notification = next;
                    if notification == ImageNotification::EndOfStream {
                        break;
                    }
                }
            }

            let fields = match notification {
                ImageNotification::EndOfStream => break,
                ImageNotification::Flush => {
                    tracing::debug!("Acquisition was stopped so flush previous images.");
                    capturing = false;
                    continue;
                }
                ImageNotification::Start => {
                    tracing::info!("Received event trigger");
                    continue;
                }
                ImageNotification::Ready(fields) => fields,
            };

            let Some(sequence) = fields.last().cloned() else {
                tracing::warn!("Image notification without sequence number");
                continue;
            };
            if self.deliver(&sequence, &mut time_list).await && gated {
                capturing = false;
                if self.shared.gated.load(Ordering::SeqCst) {
                    self.set_waiting();
                }
            }
        }
        tracing::info!("Readout camera data task ended.");
    }

    fn is_started(&self) -> bool {
        self.shared.started.load(Ordering::SeqCst)
    }

    fn set_waiting(&self) {
        if self.is_started() {
            self.shared.set_state(AcquisitionState::EventGatedWaiting);
        }
    }

    /// Issue the single-shot acquisition for the oldest queued trigger. The
    /// trigger is consumed only once the device accepted the start.
    async fn start_triggered(&self) -> TriggerStart {
        if !self.is_started() {
            self.shared.events.lock().clear();
            return TriggerStart::NoEvent;
        }
        let Some(event) = self.shared.events.lock().front().copied() else {
            return TriggerStart::NoEvent;
        };
        if let Err(e) = self
            .invoker
            .wait_async_idle(BUSY_STOP_AFTER, BUSY_STOP_ATTEMPTS)
            .await
        {
            tracing::error!("Failed to query acquisition status: {}", e);
            return TriggerStart::Failed;
        }
        if !self.is_started() {
            self.shared.events.lock().clear();
            return TriggerStart::NoEvent;
        }
        match self.invoker.acq_start(AcqMode::SingleLive).await {
            Ok(()) => {
                self.shared.events.lock().pop_front();
                tracing::warn!(
                    "Starting acquisition delayed by {} s.",
                    event.elapsed().as_secs_f64()
                );
                self.shared.set_state(AcquisitionState::EventGatedCapturing);
                TriggerStart::Started
            }
            Err(e) => {
                tracing::error!("Failed to start triggered acquisition: {}", e);
                TriggerStart::Failed
            }
        }
    }

    /// Fetch image `sequence` and broadcast it. Per-image failures are logged
    /// and the image skipped. Returns whether an image was delivered.
    async fn deliver(&self, sequence: &str, time_list: &mut Option<Vec<f64>>) -> bool {
        let received_at = Utc::now();

        let info = match self.invoker.img_ring_buffer_get(sequence).await {
            Ok(Some(info)) => info,
            Ok(None) => {
                tracing::warn!("Image info received from buffer is empty!");
                return false;
            }
            Err(e) => {
                tracing::error!("Failed to get image {} from ring buffer: {}", sequence, e);
                return false;
            }
        };
        let bytes = match self.data.read_exact_bytes(info.byte_len()).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("Did not receive an image: {}", e);
                return false;
            }
        };
        let frame = match Frame::from_le_bytes(info.width, info.height, bytes) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!("Discarding image {}: {}", sequence, e);
                return false;
            }
        };
        tracing::debug!(
            "Requested image number {}, received number {} of shape {}x{}.",
            sequence,
            info.sequence,
            info.height,
            info.width
        );

        if self.context.streak_mode() {
            match self.scaling_table().await {
                Ok(table) => *time_list = Some(table),
                Err(e) => tracing::error!("Failed to get scaling table: {}", e),
            }
        } else {
            *time_list = None;
        }

        let mut md = self.context.frame_metadata();
        match time_list {
            Some(table) => {
                md.insert(metadata::TIME_LIST.into(), json!(table));
            }
            None => {
                md.remove(metadata::TIME_LIST);
            }
        }
        let exposure = md
            .get(metadata::EXPOSURE_TIME)
            .and_then(|v| v.as_f64())
            .unwrap_or_else(|| self.context.exposure_time());
        let readout = md
            .get(metadata::READOUT_TIME)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let reception = received_at.timestamp_micros() as f64 * 1e-6;
        md.insert(
            metadata::ACQUISITION_DATE.into(),
            json!(reception - exposure + readout),
        );

        let count = self.frame_count.fetch_add(1, Ordering::SeqCst);
        let seq = info.sequence.trim().parse().unwrap_or(count);
        let mut record = ImageRecord::from_frame(&frame, seq, md);
        record.received_at = received_at;
        if self.images.send(Arc::new(record)).is_err() {
            tracing::debug!("No subscriber for image {}", seq);
        }
        true
    }

    /// Read the vertical scaling table, in seconds.
    async fn scaling_table(&self) -> RxResult<Vec<f64>> {
        tracing::debug!("Request scaling table for time axis of Hamamatsu streak camera.");
        let count = self.invoker.img_data_get_scaling_table().await?;
        let bytes = self.data.read_exact_bytes(count * 4).await?;
        let factor = self.context.time_scale_factor();
        let table: Vec<f64> = bytes
            .chunks_exact(4)
            .map(|c| f64::from(f32::from_le_bytes([c[0], c[1], c[2], c[3]])) * factor)
            .collect();
        if let (Some(first), Some(last)) = (table.first(), table.last()) {
            tracing::debug!(
                "Received scaling table for time axis from {} to {} s.",
                first,
                last
            );
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_identity() {
        let a = SoftwareTrigger::new();
        let b = a.clone();
        let c = SoftwareTrigger::new();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
        assert_eq!(a.fire(), 0);
        let _rx = a.subscribe();
        assert_eq!(b.fire(), 1);
    }
}
