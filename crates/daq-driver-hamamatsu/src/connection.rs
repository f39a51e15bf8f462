//! Command and data sockets to RemoteEx.
//!
//! The command socket is split: the read half belongs to the
//! [`ResponseRouter`](crate::router::ResponseRouter) task, the write half
//! stays here and is only used under the command invoker's lock. The data
//! socket is read by one image transfer at a time through [`DataChannel`].

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::error::{RemoteExError, RxResult};
use crate::protocol::{escape, CMD_GREETING, DATA_GREETING};
use crate::router::{ResponseRouter, RouterHandle, RouterSinks};

/// Budget for each TCP connect and greeting.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Budget for each read on the data socket.
pub const DATA_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// How long `close` waits for the router task.
pub const ROUTER_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Exclusive access to the binary data socket.
#[derive(Debug, Default)]
pub struct DataChannel {
    stream: Mutex<Option<TcpStream>>,
}

impl DataChannel {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream: Mutex::new(Some(stream)),
        }
    }

    async fn replace(&self, stream: Option<TcpStream>) {
        *self.stream.lock().await = stream;
    }

    /// Read exactly `len` bytes.
    ///
    /// Each individual read may take up to [`DATA_READ_TIMEOUT`]; a stall or a
    /// closed socket before `len` bytes arrived is a [`RemoteExError::Frame`].
    pub async fn read_exact_bytes(&self, len: usize) -> RxResult<Vec<u8>> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(RemoteExError::Closed)?;

        let mut data = vec![0u8; len];
        let mut filled = 0;
        while filled < len {
            let n = match timeout(DATA_READ_TIMEOUT, stream.read(&mut data[filled..])).await {
                Ok(Ok(0)) => {
                    return Err(RemoteExError::Frame(format!(
                        "data socket closed after {filled} of {len} bytes"
                    )))
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => return Err(RemoteExError::Io(e)),
                Err(_) => {
                    return Err(RemoteExError::Frame(format!(
                        "timed out after receiving {filled} of {len} bytes"
                    )))
                }
            };
            filled += n;
        }
        Ok(data)
    }
}

/// Owner of both RemoteEx sockets and of the router task.
#[derive(Debug)]
pub struct ConnectionManager {
    host: String,
    port: u16,
    sinks: RouterSinks,
    writer: Option<OwnedWriteHalf>,
    router: Option<RouterHandle>,
    data: Arc<DataChannel>,
    closed: bool,
}

impl ConnectionManager {
    /// Connect to `host:port` (commands) and `host:port+1` (data), check
    /// both greetings and start routing replies into `sinks`.
    pub async fn open(host: &str, port: u16, sinks: RouterSinks) -> RxResult<Self> {
        let (command, data) = open_sockets(host, port).await?;
        let (reader, writer) = command.into_split();
        let router = ResponseRouter::spawn(reader, sinks.clone());
        tracing::info!("Connected to RemoteEx at {}:{}", host, port);
        Ok(Self {
            host: host.to_string(),
            port,
            sinks,
            writer: Some(writer),
            router: Some(router),
            data: Arc::new(DataChannel::new(data)),
            closed: false,
        })
    }

    /// Data socket shared with the acquisition engine.
    pub fn data_channel(&self) -> Arc<DataChannel> {
        self.data.clone()
    }

    /// Write one encoded command.
    ///
    /// If the write fails, both sockets are reopened and the router is
    /// restarted, then the write is attempted once more.
    pub async fn send(&mut self, bytes: &[u8]) -> RxResult<()> {
        tracing::debug!("Sending: '{}'", escape(bytes));
        let peer_closed = self.router.as_ref().is_some_and(RouterHandle::peer_closed);
        let first = match self.writer.as_mut() {
            Some(_) if peer_closed => Err(RemoteExError::Connection(
                "command socket closed by RemoteEx".to_string(),
            )),
            Some(writer) => write_flush(writer, bytes).await,
            None if self.closed => Err(RemoteExError::Closed),
            // a previous reconnect failed
            None => Err(RemoteExError::Connection("not connected".to_string())),
        };
        let Err(e) = first else {
            return Ok(());
        };
        if matches!(e, RemoteExError::Closed) {
            return Err(e);
        }

        tracing::warn!(
            "Failed to send the command {} ({}), will try to reconnect to RemoteEx.",
            escape(bytes),
            e
        );
        self.reconnect()
            .await
            .map_err(|e| RemoteExError::Connection(e.to_string()))?;
        tracing::debug!("Sending: '{}'", escape(bytes));
        match self.writer.as_mut() {
            Some(writer) => write_flush(writer, bytes)
                .await
                .map_err(|e| RemoteExError::Connection(e.to_string())),
            None => Err(RemoteExError::Closed),
        }
    }

    async fn reconnect(&mut self) -> RxResult<()> {
        if let Some(router) = self.router.take() {
            router.stop(Duration::from_secs(2)).await;
        }
        self.writer = None;
        self.data.replace(None).await;

        let (command, data) = open_sockets(&self.host, self.port).await?;
        let (reader, writer) = command.into_split();
        self.router = Some(ResponseRouter::spawn(reader, self.sinks.clone()));
        self.writer = Some(writer);
        self.data.replace(Some(data)).await;
        tracing::info!("Reconnected to RemoteEx at {}:{}", self.host, self.port);
        Ok(())
    }

    /// Whether the router task is alive.
    pub fn is_listening(&self) -> bool {
        self.router.as_ref().is_some_and(RouterHandle::is_running)
    }

    /// Whether the router is alive and the server has not hung up.
    pub fn is_connected(&self) -> bool {
        self.router
            .as_ref()
            .is_some_and(|router| router.is_running() && !router.peer_closed())
    }

    /// Stop the router and drop both sockets. Safe to call twice.
    pub async fn close(&mut self) {
        self.closed = true;
        if let Some(router) = self.router.take() {
            router.stop(ROUTER_JOIN_TIMEOUT).await;
        }
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.shutdown().await;
        }
        self.data.replace(None).await;
    }
}

async fn write_flush(writer: &mut OwnedWriteHalf, bytes: &[u8]) -> RxResult<()> {
    writer.write_all(bytes).await?;
    writer.flush().await?;
    Ok(())
}

async fn open_sockets(host: &str, port: u16) -> RxResult<(TcpStream, TcpStream)> {
    let data_port = port
        .checked_add(1)
        .ok_or_else(|| RemoteExError::Connection(format!("no data port above {port}")))?;
    let mut command = connect(host, port).await?;
    let mut data = connect(host, data_port).await?;
    expect_greeting(&mut command, CMD_GREETING, port).await?;
    expect_greeting(&mut data, DATA_GREETING, data_port).await?;
    Ok((command, data))
}

async fn connect(host: &str, port: u16) -> RxResult<TcpStream> {
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| {
            RemoteExError::Connection(format!("timeout connecting to {host}:{port}"))
        })?
        .map_err(|e| {
            RemoteExError::Connection(format!(
                "failed to connect to host {host} using port {port} ({e}). Check the server is \
                 connected to the network, turned on, and correctly configured."
            ))
        })?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn expect_greeting(stream: &mut TcpStream, greeting: &[u8], port: u16) -> RxResult<()> {
    let mut received = vec![0u8; greeting.len()];
    match timeout(CONNECT_TIMEOUT, stream.read_exact(&mut received)).await {
        Ok(Ok(_)) if received == greeting => Ok(()),
        Ok(Ok(_)) => Err(RemoteExError::NotReady(format!(
            "unexpected greeting '{}' on port {port}",
            escape(&received)
        ))),
        Ok(Err(e)) => Err(RemoteExError::NotReady(format!(
            "no greeting on port {port} ({e})"
        ))),
        Err(_) => Err(RemoteExError::NotReady(
            "RemoteEx didn't respond. Check that it is running properly, or restart the streak \
             camera computer."
                .to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::LogRing;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn sinks() -> RouterSinks {
        let (responses, _) = mpsc::unbounded_channel();
        let (images, _) = mpsc::unbounded_channel();
        RouterSinks {
            responses,
            images,
            log: LogRing::new(),
        }
    }

    async fn adjacent_listeners() -> (TcpListener, TcpListener, u16) {
        loop {
            let first = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = first.local_addr().unwrap().port();
            if port == u16::MAX {
                continue;
            }
            if let Ok(second) = TcpListener::bind(("127.0.0.1", port + 1)).await {
                return (first, second, port);
            }
        }
    }

    #[tokio::test]
    async fn rejects_wrong_greeting() {
        let (cmd, data, port) = adjacent_listeners().await;
        tokio::spawn(async move {
            let (mut c, _) = cmd.accept().await.unwrap();
            let (mut d, _) = data.accept().await.unwrap();
            c.write_all(b"Hello World!!!\r").await.unwrap();
            d.write_all(DATA_GREETING).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let err = ConnectionManager::open("127.0.0.1", port, sinks())
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteExError::NotReady(_)), "{err}");
    }

    #[tokio::test]
    async fn reads_exact_byte_count_across_segments() {
        let (cmd, data, port) = adjacent_listeners().await;
        tokio::spawn(async move {
            let (mut c, _) = cmd.accept().await.unwrap();
            let (mut d, _) = data.accept().await.unwrap();
            c.write_all(CMD_GREETING).await.unwrap();
            d.write_all(DATA_GREETING).await.unwrap();
            d.write_all(&[1, 2, 3]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            d.write_all(&[4, 5]).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let mut conn = ConnectionManager::open("127.0.0.1", port, sinks())
            .await
            .unwrap();
        assert!(conn.is_listening());
        let bytes = conn.data_channel().read_exact_bytes(5).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5]);
        conn.close().await;
        assert!(!conn.is_listening());
        conn.close().await;
    }
}
