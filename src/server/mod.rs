//! Server Module
//!
//! The server handle, its admission-control accept loop and statistics.

pub mod manager;

pub use manager::{ServerStats, TcpServer};
