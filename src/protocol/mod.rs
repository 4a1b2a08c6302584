//! Wire Protocol
//!
//! The accept-time handshake byte and the length-prefixed frame codec
//! used by every connection.

pub mod codec;
pub mod constants;

pub use codec::{encode_frame, read_frame, write_frame};
pub use constants::*;
