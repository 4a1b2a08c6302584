//! Server error types.

use std::net::SocketAddr;

use thiserror::Error;

use crate::connection::ConnectionId;

/// Errors that can occur while building or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// A required configuration value is missing or contradictory,
    /// or the external configuration source could not be read.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The listening socket could not be opened.
    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        source: std::io::Error,
    },

    /// The accept call timed out. Never surfaced by the accept loop.
    #[error("accept timed out")]
    AcceptTimeout,

    /// Unexpected failure of the listening socket.
    #[error("accept failed: {0}")]
    Accept(#[source] std::io::Error),

    /// Writing to a single connection failed.
    #[error("failed to send to connection {id}: {source}")]
    Send {
        id: ConnectionId,
        source: std::io::Error,
    },

    /// The connection was already closed.
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),

    /// The peer announced a frame larger than the configured maximum.
    #[error("frame of {size} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// `run` was called while the accept loop was already running.
    #[error("accept loop is already running")]
    AlreadyRunning,

    /// The worker pool no longer accepts work.
    #[error("worker pool is shut down")]
    PoolShutdown,

    /// Generic I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    /// Creates a configuration error from anything printable.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }
}
