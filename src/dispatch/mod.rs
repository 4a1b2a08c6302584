//! Dispatch Module
//!
//! Routes connection events to the registry and received packets to the
//! configured consumer: a synchronous handler or the incoming packet queue.

pub mod handler;
pub mod queue;
pub mod router;

pub use handler::{PacketHandler, ServerCallbackHandler};
pub use queue::IncomingPacketQueue;
pub use router::{DispatchRouter, Dispatcher};
