//! Call/response primitive on top of the connection.
//!
//! RemoteEx replies carry no request id, only the function name. Only one
//! command may therefore be in flight: the invoker holds its lock from the
//! moment the command is written until the reply with the same name (compared
//! case-insensitively) has been taken from the reply queue. Replies with any
//! other name are stale answers to earlier, timed-out commands and are
//! skipped.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{timeout_at, Instant};
use tracing::instrument;

use crate::connection::{ConnectionManager, DataChannel};
use crate::error::{RemoteExError, RxResult};
use crate::protocol::{Command, Response, STATUS_OK};
use crate::router::{ImageNotification, LogRing, ResponseEvent, RouterSinks};

/// Reply budget used when the caller does not give one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

struct InvokerState {
    conn: ConnectionManager,
    responses: mpsc::UnboundedReceiver<ResponseEvent>,
    closed: bool,
}

/// Serialised command execution against one RemoteEx server.
pub struct CommandInvoker {
    state: Mutex<InvokerState>,
    default_timeout: Duration,
    responses_tx: mpsc::UnboundedSender<ResponseEvent>,
    images_tx: mpsc::UnboundedSender<ImageNotification>,
    images_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ImageNotification>>>,
    log: LogRing,
    data: Arc<DataChannel>,
}

impl std::fmt::Debug for CommandInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandInvoker")
            .field("default_timeout", &self.default_timeout)
            .field("log_entries", &self.log.len())
            .finish()
    }
}

impl CommandInvoker {
    /// Open both sockets and start the router.
    pub async fn connect(host: &str, port: u16, default_timeout: Duration) -> RxResult<Self> {
        let (responses_tx, responses) = mpsc::unbounded_channel();
        let (images_tx, images_rx) = mpsc::unbounded_channel();
        let log = LogRing::new();
        let sinks = RouterSinks {
            responses: responses_tx.clone(),
            images: images_tx.clone(),
            log: log.clone(),
        };
        let conn = ConnectionManager::open(host, port, sinks).await?;
        let data = conn.data_channel();
        let invoker = Self {
            state: Mutex::new(InvokerState {
                conn,
                responses,
                closed: false,
            }),
            default_timeout,
            responses_tx,
            images_tx,
            images_rx: parking_lot::Mutex::new(Some(images_rx)),
            log,
            data,
        };
        Ok(invoker)
    }

    /// Sender into the image-notification queue, for flush and trigger tokens.
    pub fn image_sender(&self) -> mpsc::UnboundedSender<ImageNotification> {
        self.images_tx.clone()
    }

    /// Receiving end of the image-notification queue. Only the first caller gets it.
    pub fn take_image_notifications(&self) -> Option<mpsc::UnboundedReceiver<ImageNotification>> {
        self.images_rx.lock().take()
    }

    /// Diagnostic log ring filled by the router.
    pub fn log(&self) -> &LogRing {
        &self.log
    }

    /// Data socket for image transfers.
    pub fn data_channel(&self) -> Arc<DataChannel> {
        self.data.clone()
    }

    /// Run `command` with the default timeout and return its result fields.
    pub async fn invoke(&self, command: Command) -> RxResult<Vec<String>> {
        self.invoke_with_timeout(command, self.default_timeout).await
    }

    /// Run `command`, waiting at most `wait` for its reply.
    #[instrument(skip(self, command), fields(command = %command), err)]
    pub async fn invoke_with_timeout(
        &self,
        command: Command,
        wait: Duration,
    ) -> RxResult<Vec<String>> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(RemoteExError::Closed);
        }

        while let Ok(stale) = state.responses.try_recv() {
            if let ResponseEvent::Message(msg) = stale {
                tracing::debug!("Discarding unclaimed reply {}", msg);
            }
        }

        state.conn.send(&command.encode()).await?;

        let deadline = Instant::now() + wait;
        let mut last: Option<Response> = None;
        loop {
            let event = match timeout_at(deadline, state.responses.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => return Err(RemoteExError::Closed),
                Err(_) => {
                    let last_response = last.as_ref().map(ToString::to_string);
                    tracing::error!(
                        "No answer to {} within {:?}, last response: {}",
                        command,
                        wait,
                        last_response.as_deref().unwrap_or("none")
                    );
                    return Err(RemoteExError::Timeout {
                        command: command.name().to_string(),
                        waited: wait,
                        last_response,
                    });
                }
            };
            let msg = match event {
                ResponseEvent::Message(msg) => msg,
                ResponseEvent::Shutdown => return Err(RemoteExError::Closed),
            };
            if !msg.answers(command.name()) {
                tracing::debug!("Skipping reply {} while waiting for {}", msg, command.name());
                last = Some(msg);
                continue;
            }
            if msg.code != STATUS_OK {
                let err = RemoteExError::Device {
                    code: msg.code,
                    function: msg.function,
                    args: msg.args,
                };
                tracing::warn!("{} for command {}", err, command);
                return Err(err);
            }
            return Ok(msg.args);
        }
    }

    /// Whether the command socket is open and read by the router.
    pub async fn is_connected(&self) -> bool {
        let state = self.state.lock().await;
        !state.closed && state.conn.is_connected()
    }

    /// Wake any waiting caller, stop the router and close the sockets.
    pub async fn shutdown(&self) {
        let _ = self.responses_tx.send(ResponseEvent::Shutdown);
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        state.conn.close().await;
        tracing::info!("RemoteEx connection closed");
    }
}
