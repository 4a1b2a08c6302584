//! Dispatch Router

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace};

use super::handler::PacketHandler;
use super::queue::IncomingPacketQueue;
use crate::connection::{ConnectionEvent, ConnectionId, ConnectionRegistry, EventSink, PacketEnvelope};

/// Where received packets go. Fixed for the lifetime of a server.
#[derive(Clone)]
pub enum Dispatcher {
    /// Call the handler inline on the connection's worker task
    Handler(Arc<dyn PacketHandler>),
    /// Push onto the shared queue for an external consumer
    Queue(Arc<IncomingPacketQueue>),
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handler(_) => f.write_str("Dispatcher::Handler"),
            Self::Queue(queue) => write!(f, "Dispatcher::Queue(len={})", queue.len()),
        }
    }
}

/// Single entry point for every connection's events
#[derive(Debug)]
pub struct DispatchRouter {
    registry: Arc<ConnectionRegistry>,
    dispatcher: Dispatcher,
}

impl DispatchRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, dispatcher: Dispatcher) -> Self {
        Self {
            registry,
            dispatcher,
        }
    }

    /// Remove a connection from the registry and close it.
    ///
    /// Returns false when the id was not registered; late or duplicate
    /// reports land here and are ignored.
    pub fn handle_disconnected(&self, id: ConnectionId) -> bool {
        let Some(record) = self.registry.remove(&id) else {
            trace!("Ignoring disconnect for unregistered connection {}", id);
            return false;
        };

        debug!(
            "Removed connection [{}] from [{}] after {:?}",
            id,
            record.host,
            record.accepted_at.elapsed()
        );
        debug!("Remaining connections: {}", self.registry.len());
        record.connection.disconnect();
        true
    }

    /// Hand a received payload to the configured consumer
    pub fn handle_packet(&self, id: ConnectionId, payload: Bytes) {
        let envelope = PacketEnvelope::new(id, payload);
        match &self.dispatcher {
            Dispatcher::Handler(handler) => handler.handle(envelope),
            Dispatcher::Queue(queue) => queue.push(envelope),
        }
    }
}

impl EventSink for DispatchRouter {
    fn dispatch(&self, event: ConnectionEvent) {
        trace!("Dispatching event for connection {}", event.connection_id());
        match event {
            ConnectionEvent::Disconnected { id } => {
                self.handle_disconnected(id);
            }
            ConnectionEvent::ReceivedPacket { id, payload } => self.handle_packet(id, payload),
        }
    }
}
