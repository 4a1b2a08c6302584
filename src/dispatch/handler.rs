//! Application Callbacks

use std::sync::Arc;

use crate::connection::{Connection, PacketEnvelope};

/// Consumer of received packets in handler dispatch mode.
///
/// `handle` runs on the reporting connection's own worker task, so a slow
/// handler delays further reads from that connection only.
pub trait PacketHandler: Send + Sync {
    fn handle(&self, envelope: PacketEnvelope);
}

impl<F> PacketHandler for F
where
    F: Fn(PacketEnvelope) + Send + Sync,
{
    fn handle(&self, envelope: PacketEnvelope) {
        self(envelope)
    }
}

/// Optional server lifecycle notifications.
///
/// Both methods run on the blocking thread pool and are abandoned by the
/// accept loop after the configured callback timeout.
pub trait ServerCallbackHandler: Send + Sync {
    /// The accept loop has started
    fn on_started(&self) {}

    /// A connection was admitted and acknowledged
    fn on_new_connection(&self, _connection: &Arc<Connection>) {}
}
