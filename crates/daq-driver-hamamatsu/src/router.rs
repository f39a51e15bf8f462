//! Background reader for the command socket.
//!
//! ```text
//!                    ┌──────────────────────────┐
//!  command socket ──▶│ ResponseRouter task      │
//!                    │  MessageDecoder          │
//!                    └──┬──────────┬─────────┬──┘
//!        code 4 + Livemonitor      │ 4 / 5   │ everything else
//!                       ▼          ▼         ▼
//!              image notifications LogRing   command replies
//!              (AcquisitionEngine)           (CommandInvoker)
//! ```
//!
//! RemoteEx sometimes cuts one reply into several TCP segments. After each
//! read the task waits 3 ms and drains whatever is immediately readable
//! before splitting, which catches most split replies early. Anything still
//! unterminated stays in the decoder until the next read, so a reply split
//! beyond that window is still completed later.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::protocol::{
    decode_message, escape, MessageDecoder, Response, LIVE_MONITOR, STATUS_ASYNC, STATUS_LOG,
};

/// Number of log lines kept for diagnostics.
pub const LOG_RING_CAPACITY: usize = 16;

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const EXTRA_WAIT: Duration = Duration::from_millis(3);
const MAX_EXTRA_READS: usize = 100;
const READ_BUFFER: usize = 4096;

/// Bounded buffer of the most recent log messages, oldest evicted first.
#[derive(Debug, Clone, Default)]
pub struct LogRing {
    entries: Arc<Mutex<VecDeque<Response>>>,
}

impl LogRing {
    /// Empty ring.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a log message.
    pub fn push(&self, entry: Response) {
        let mut entries = self.entries.lock();
        entries.push_back(entry);
        while entries.len() > LOG_RING_CAPACITY {
            entries.pop_front();
        }
    }

    /// Copy of the retained messages, oldest first.
    pub fn entries(&self) -> Vec<Response> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether nothing has been logged.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Whether RemoteEx reported a communication error with the camera,
    /// which it does at `AppStart` when the hardware is unreachable.
    pub fn has_communication_error(&self) -> bool {
        self.entries.lock().iter().any(|entry| {
            entry.code == STATUS_ASYNC
                && entry
                    .to_string()
                    .to_lowercase()
                    .contains("communication error")
        })
    }
}

/// Entries of the image-notification queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageNotification {
    /// A new image is in the ring buffer; fields as sent by `Livemonitor`.
    Ready(Vec<String>),
    /// A software trigger fired.
    Start,
    /// The acquisition was stopped; pending notifications are stale.
    Flush,
    /// Terminate the acquisition task.
    EndOfStream,
}

/// Entries of the reply queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseEvent {
    /// A reply to some command.
    Message(Response),
    /// The client is shutting down.
    Shutdown,
}

/// Destinations of the routed messages.
#[derive(Debug, Clone)]
pub struct RouterSinks {
    /// Replies for the command invoker.
    pub responses: mpsc::UnboundedSender<ResponseEvent>,
    /// Image notifications for the acquisition engine.
    pub images: mpsc::UnboundedSender<ImageNotification>,
    /// Diagnostic log.
    pub log: LogRing,
}

/// Where a decoded message goes.
#[derive(Debug, PartialEq, Eq)]
enum Route {
    Image,
    Log,
    Reply,
}

fn classify(msg: &Response) -> Route {
    match msg.code {
        STATUS_ASYNC if msg.function == LIVE_MONITOR => Route::Image,
        STATUS_ASYNC | STATUS_LOG => Route::Log,
        _ => Route::Reply,
    }
}

impl RouterSinks {
    /// Deliver one decoded message to its queue.
    pub fn dispatch(&self, msg: Response) {
        match classify(&msg) {
            Route::Image => {
                if self.images.send(ImageNotification::Ready(msg.args)).is_err() {
                    tracing::debug!("No acquisition task listening, image notification dropped");
                }
            }
            Route::Log => {
                tracing::debug!("RemoteEx log: {}", msg);
                self.log.push(msg);
            }
            Route::Reply => {
                if self.responses.send(ResponseEvent::Message(msg)).is_err() {
                    tracing::debug!("Command invoker gone, reply dropped");
                }
            }
        }
    }

    /// Decode and dispatch every complete message held by `decoder`.
    pub fn dispatch_complete(&self, decoder: &mut MessageDecoder) {
        for raw in decoder.take_messages() {
            match decode_message(&raw) {
                Ok(msg) => {
                    tracing::debug!("Interpreted response: {}", escape(raw.as_bytes()));
                    self.dispatch(msg);
                }
                Err(e) => tracing::warn!("Skipping unexpected response: {}", e),
            }
        }
    }
}

/// Spawner for the command-socket reader.
pub struct ResponseRouter;

impl ResponseRouter {
    /// Start reading `reader` and routing into `sinks`.
    pub fn spawn(reader: OwnedReadHalf, sinks: RouterSinks) -> RouterHandle {
        let running = Arc::new(AtomicBool::new(true));
        let peer_closed = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(reader, sinks, running.clone(), peer_closed.clone()));
        RouterHandle {
            running,
            peer_closed,
            task,
        }
    }
}

/// Handle on a running router task.
#[derive(Debug)]
pub struct RouterHandle {
    running: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl RouterHandle {
    /// Whether the task is still running.
    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Whether RemoteEx closed the command socket or reading it failed.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed.load(Ordering::SeqCst)
    }

    /// Stop the task, waiting at most `grace` for it to finish.
    pub async fn stop(mut self, grace: Duration) {
        self.running.store(false, Ordering::SeqCst);
        if tokio::time::timeout(grace, &mut self.task).await.is_err() {
            tracing::warn!("Response router did not stop within {:?}, aborting it", grace);
            self.task.abort();
        }
    }
}

async fn run(
    mut reader: OwnedReadHalf,
    sinks: RouterSinks,
    running: Arc<AtomicBool>,
    peer_closed: Arc<AtomicBool>,
) {
    tracing::info!("RemoteEx response router started");
    let mut decoder = MessageDecoder::new();
    let mut buf = vec![0u8; READ_BUFFER];

    while running.load(Ordering::SeqCst) {
        let n = match tokio::time::timeout(READ_TIMEOUT, reader.read(&mut buf)).await {
            Err(_) => continue,
            Ok(Ok(0)) => {
                if !peer_closed.swap(true, Ordering::SeqCst) {
                    tracing::warn!("RemoteEx closed the command socket");
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                if !peer_closed.swap(true, Ordering::SeqCst) {
                    tracing::error!("Reading RemoteEx command socket failed: {}", e);
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        tracing::debug!("Received: '{}'", escape(&buf[..n]));
        decoder.push(&buf[..n]);

        let mut drained = false;
        for _ in 0..MAX_EXTRA_READS {
            tokio::time::sleep(EXTRA_WAIT).await;
            match reader.try_read(&mut buf) {
                Ok(0) => {
                    drained = true;
                    break;
                }
                Ok(n) => {
                    tracing::debug!("Received extra: '{}'", escape(&buf[..n]));
                    decoder.push(&buf[..n]);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    drained = true;
                    break;
                }
                Err(e) => {
                    tracing::debug!("No more data available: {}", e);
                    drained = true;
                    break;
                }
            }
        }
        if !drained {
            tracing::warn!("Responses keep coming in, will process the data received so far.");
        }

        sinks.dispatch_complete(&mut decoder);
    }
    tracing::info!("RemoteEx response router ended");
}
