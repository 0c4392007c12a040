//! # Frame Transport
//!
//! Length-prefixed framing over any async byte stream. Every frame is
//! `u32_be(length) || body[length]`; the body is produced and consumed by the
//! message codec.
//!
//! Reads loop until the full frame is buffered (`read_exact`), so short reads
//! on the underlying socket never surface as protocol errors. A hard cap on
//! the frame length bounds memory per connection.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a frame body. Frames above this are treated as a framing
/// error and tear the connection down before any allocation happens.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Read one frame body from the stream.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. An EOF
/// inside the length prefix or the body is a truncated frame and surfaces as
/// an error.
pub async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte cap"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Write one frame body to the stream, prefixed with its big-endian length.
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.len() > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte cap", body.len()),
        ));
    }

    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await
}
