//! tcpgate
//!
//! Embeddable TCP server core. An accept loop admits clients against a
//! worker bound and answers each with a one-byte handshake; every admitted
//! connection runs on its own worker task, is tracked in a registry, and
//! delivers length-prefixed packets either to a synchronous handler or to
//! a queue drained by the application.

pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod shutdown;

pub use config::{DispatchMode, ServerBuilder, ServerConfiguration, SourceConfig};
pub use connection::{Connection, ConnectionId, PacketEnvelope};
pub use dispatch::{IncomingPacketQueue, PacketHandler, ServerCallbackHandler};
pub use error::ServerError;
pub use server::{ServerStats, TcpServer};
pub use shutdown::ShutdownCoordinator;

/// Common result type for the server
pub type Result<T> = std::result::Result<T, ServerError>;
