//! Async frame reading and writing.
//!
//! See [`warden_protocol::frame`] for the byte layout.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use warden_protocol::constants::FRAME_HEADER_LEN;
use warden_protocol::{Frame, FrameHeader};

use crate::error::TransportError;

/// Writes one frame and flushes.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), TransportError> {
    let bytes = frame.encode()?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame.
///
/// Returns `None` on a clean EOF at a frame boundary. EOF inside a frame
/// is an I/O error; a malformed header or payload is a frame error.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<Frame>, TransportError> {
    let mut raw = [0u8; FRAME_HEADER_LEN];
    if reader.read(&mut raw[..1]).await? == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut raw[1..]).await?;
    let header = FrameHeader::parse(raw)?;

    let mut payload = vec![0u8; header.payload_len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Frame::decode(header.frame_type, &payload)?))
}
