//! Length-Prefixed Frame Codec
//!
//! Every frame is a big-endian `u32` payload length followed by the payload.

use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::constants::FRAME_HEADER_LEN;
use crate::error::ServerError;

/// Encode a payload into a single frame
pub fn encode_frame(payload: &[u8]) -> io::Result<Bytes> {
    let len = u32::try_from(payload.len()).map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("payload of {} bytes does not fit in a frame", payload.len()),
        )
    })?;

    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Write a single frame and flush it
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(payload)?;
    writer.write_all(&frame).await?;
    writer.flush().await
}

/// Read the next frame.
///
/// Returns `Ok(None)` when the peer closes the stream on a frame boundary.
/// A stream that ends inside a frame is an `UnexpectedEof` error.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Bytes>, ServerError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream closed inside a frame header",
            )
            .into());
        }
        filled += n;
    }

    let size = u32::from_be_bytes(header) as usize;
    if size > max_frame_size {
        return Err(ServerError::FrameTooLarge {
            size,
            max: max_frame_size,
        });
    }

    let mut payload = BytesMut::zeroed(size);
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload.freeze()))
}
