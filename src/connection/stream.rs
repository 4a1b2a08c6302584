//! Connection Implementation

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, instrument, trace, warn};

use super::types::{ConnectionEvent, ConnectionId, EventSink};
use crate::error::ServerError;
use crate::protocol::{encode_frame, read_frame};

/// One accepted client socket.
///
/// The read half is driven by [`Connection::run`] on a worker task; the
/// write half is shared by [`Connection::send`] and the handshake byte.
/// Pending writes abandon the socket as soon as the connection closes.
pub struct Connection {
    id: ConnectionId,
    host: String,
    peer_addr: Option<SocketAddr>,
    max_frame_size: usize,
    healthy: bool,
    reader: Mutex<Option<OwnedReadHalf>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    sink: OnceLock<Arc<dyn EventSink>>,
    closed: AtomicBool,
    close_signal: watch::Sender<bool>,
}

impl Connection {
    /// Wrap an accepted stream.
    ///
    /// Setup failures do not return an error; the connection is created
    /// unhealthy instead and the caller is expected to drop it.
    pub fn new(id: ConnectionId, stream: TcpStream, max_frame_size: usize) -> Self {
        let setup = stream.peer_addr().and_then(|addr| {
            stream.set_nodelay(true)?;
            Ok(addr)
        });

        match setup {
            Ok(addr) => {
                let (reader, writer) = stream.into_split();
                Self {
                    id,
                    host: addr.ip().to_string(),
                    peer_addr: Some(addr),
                    max_frame_size,
                    healthy: true,
                    reader: Mutex::new(Some(reader)),
                    writer: tokio::sync::Mutex::new(Some(writer)),
                    sink: OnceLock::new(),
                    closed: AtomicBool::new(false),
                    close_signal: watch::channel(false).0,
                }
            }
            Err(e) => {
                warn!("Failed to set up connection {}: {}", id, e);
                Self {
                    id,
                    host: "unknown".to_string(),
                    peer_addr: None,
                    max_frame_size,
                    healthy: false,
                    reader: Mutex::new(None),
                    writer: tokio::sync::Mutex::new(None),
                    sink: OnceLock::new(),
                    closed: AtomicBool::new(true),
                    close_signal: watch::channel(true).0,
                }
            }
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Remote IP address as text
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// False if socket setup failed during construction
    pub fn is_healthy(&self) -> bool {
        self.healthy
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Register the sink that receives this connection's events.
    /// Only the first call takes effect.
    pub fn attach(&self, sink: Arc<dyn EventSink>) {
        if self.sink.set(sink).is_err() {
            debug!("Connection {} already has an event sink attached", self.id);
        }
    }

    /// Send one framed payload to the peer.
    ///
    /// A send stalled on a peer that stops reading fails with
    /// [`ServerError::Send`] once the connection is disconnected.
    pub async fn send(&self, payload: &[u8]) -> Result<(), ServerError> {
        if self.is_closed() {
            return Err(ServerError::ConnectionClosed(self.id));
        }

        let frame =
            encode_frame(payload).map_err(|source| ServerError::Send { id: self.id, source })?;
        self.write_closable(&frame).await?;

        trace!("Sent {} bytes to connection {}", payload.len(), self.id);
        Ok(())
    }

    /// Write the raw accept-time handshake byte, bypassing framing
    pub async fn acknowledge(&self, byte: u8) -> Result<(), ServerError> {
        self.write_closable(&[byte]).await
    }

    /// Write and flush raw bytes, racing the write against the close
    /// signal. A write cut short by a close drops the write half.
    async fn write_closable(&self, bytes: &[u8]) -> Result<(), ServerError> {
        let mut guard = tokio::select! {
            biased;

            _ = self.wait_closed() => return Err(ServerError::ConnectionClosed(self.id)),
            guard = self.writer.lock() => guard,
        };
        let Some(writer) = guard.as_mut() else {
            return Err(ServerError::ConnectionClosed(self.id));
        };

        let result = tokio::select! {
            biased;

            _ = self.wait_closed() => Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "connection closed while writing",
            )),
            result = async {
                writer.write_all(bytes).await?;
                writer.flush().await
            } => result,
        };

        if let Err(source) = result {
            if self.is_closed() {
                guard.take();
            }
            return Err(ServerError::Send { id: self.id, source });
        }
        Ok(())
    }

    /// Close the connection. Safe to call any number of times.
    ///
    /// Pending sends are abandoned at once. The worker running
    /// [`Connection::run`] notices the close, shuts the socket down and
    /// reports `Disconnected`.
    pub fn disconnect(&self) {
        if self.mark_closed() {
            debug!("Disconnecting connection {} from {}", self.id, self.host);
        }
    }

    /// Raise the closed flag and wake every waiter. Returns true for the
    /// call that actually closed the connection.
    fn mark_closed(&self) -> bool {
        let first = !self.closed.swap(true, Ordering::AcqRel);
        self.close_signal.send_replace(true);
        first
    }

    /// Resolves once the connection is closed
    async fn wait_closed(&self) {
        let mut closed = self.close_signal.subscribe();
        let _ = closed.wait_for(|closed| *closed).await;
    }

    /// Worker body: read frames until the peer leaves, a read fails,
    /// or the connection is disconnected locally.
    #[instrument(skip(self), fields(connection_id = %self.id, host = %self.host))]
    pub async fn run(self: Arc<Self>) {
        let _guard = DisconnectGuard {
            connection: Arc::clone(&self),
        };

        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut reader) = reader else {
            debug!("Connection has no reader, worker exiting");
            return;
        };

        loop {
            if self.is_closed() {
                break;
            }

            tokio::select! {
                biased;

                _ = self.wait_closed() => {
                    debug!("Connection closed locally");
                    break;
                }
                frame = read_frame(&mut reader, self.max_frame_size) => match frame {
                    Ok(Some(payload)) => {
                        trace!("Received frame of {} bytes", payload.len());
                        self.emit(ConnectionEvent::ReceivedPacket { id: self.id, payload });
                    }
                    Ok(None) => {
                        debug!("Peer closed the connection");
                        break;
                    }
                    Err(ServerError::FrameTooLarge { size, max }) => {
                        warn!("Peer sent a frame of {} bytes (max {}), closing", size, max);
                        break;
                    }
                    Err(e) => {
                        debug!("Read failed: {}", e);
                        break;
                    }
                }
            }
        }

        // Wakes any send still holding the writer, so the lock below is short.
        self.mark_closed();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                trace!("Socket shutdown failed: {}", e);
            }
        }
    }

    fn emit(&self, event: ConnectionEvent) {
        match self.sink.get() {
            Some(sink) => sink.dispatch(event),
            None => trace!("No sink attached to connection {}, dropping event", self.id),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("host", &self.host)
            .field("healthy", &self.healthy)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Reports `Disconnected` when the worker ends, including by panic.
struct DisconnectGuard {
    connection: Arc<Connection>,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        let connection = &self.connection;
        connection.mark_closed();
        if let Ok(mut writer) = connection.writer.try_lock() {
            writer.take();
        }
        connection.emit(ConnectionEvent::Disconnected { id: connection.id });
    }
}
