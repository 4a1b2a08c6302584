//! Connection Types

use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

/// Opaque unique identifier of an accepted connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Access the underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a tracked connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closed,
}

/// Events a connection reports to its sink
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The connection stopped reading, either because the peer went away
    /// or because it was disconnected locally.
    Disconnected { id: ConnectionId },
    /// A complete frame arrived.
    ReceivedPacket { id: ConnectionId, payload: Bytes },
}

impl ConnectionEvent {
    /// Id of the connection that reported the event
    pub fn connection_id(&self) -> ConnectionId {
        match self {
            Self::Disconnected { id } | Self::ReceivedPacket { id, .. } => *id,
        }
    }
}

/// A received payload together with the connection it came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketEnvelope {
    pub connection_id: ConnectionId,
    pub payload: Bytes,
}

impl PacketEnvelope {
    pub fn new(connection_id: ConnectionId, payload: Bytes) -> Self {
        Self {
            connection_id,
            payload,
        }
    }
}

/// Receiver of connection events.
///
/// Implementations are called from every connection worker concurrently.
pub trait EventSink: Send + Sync {
    fn dispatch(&self, event: ConnectionEvent);
}
