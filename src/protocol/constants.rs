//! Wire Protocol Constants

// Accept-time handshake, written as a single raw byte before any framing
pub const HANDSHAKE_REJECT: u8 = 0x00;
pub const HANDSHAKE_ACCEPT: u8 = 0x01;

// Frame header: payload length as a big-endian u32
pub const FRAME_HEADER_LEN: usize = 4;

// Largest payload accepted from a peer unless configured otherwise
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
