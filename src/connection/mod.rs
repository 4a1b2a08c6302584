//! Connection Module
//!
//! A single accepted socket, the events it reports, and the registry
//! that tracks every live connection.

pub mod registry;
pub mod stream;
pub mod types;

pub use registry::{ConnectionRecord, ConnectionRegistry, ConnectionSummary};
pub use stream::Connection;
pub use types::{ConnectionEvent, ConnectionId, ConnectionState, EventSink, PacketEnvelope};

#[cfg(test)]
pub(crate) mod test_support {
    use tokio::net::{TcpListener, TcpStream};

    /// Connected loopback pair: (server side, client side)
    pub async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (accepted.unwrap().0, client.unwrap())
    }
}
