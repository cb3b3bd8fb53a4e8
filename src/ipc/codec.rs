//! Frame codec for the broker wire protocol.
//!
//! Frame format:
//! ```text
//! ┌──────────┬──────────┬───────────┬─────────────┬───────────┐
//! │ len (4B) │ type(1B) │ peer (4B) │ target (16B)│  payload  │
//! │ u32 BE   │ u8       │ u32 LE    │ uuid bytes  │           │
//! └──────────┴──────────┴───────────┴─────────────┴───────────┘
//! ```
//! Length = type byte + body, NOT including the 4-byte prefix.
//!
//! `peer` is the sender on broker-to-client frames. Clients write `0`; the
//! broker stamps the connection's own id on everything it receives.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::buf::Reader;
use crate::types::{ClientId, Result, TargetId};

/// Message type: one routed envelope.
pub const MSG_ENVELOPE: u8 = 0x01;

/// Bytes of body before the payload: peer id plus target id.
pub const ENVELOPE_HEADER_LEN: usize = 4 + 16;

/// Read one frame from the stream.
///
/// Returns `(msg_type, body)`. Returns `None` on clean EOF.
/// `max_frame_bytes` caps the accepted frame length before anything is
/// allocated.
pub async fn read_frame<R: AsyncReadExt + Unpin>(
    reader: &mut R,
    max_frame_bytes: u32,
) -> std::io::Result<Option<(u8, Bytes)>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let frame_len = u32::from_be_bytes(len_buf);
    if frame_len > max_frame_bytes {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("frame too large: {} bytes", frame_len),
        ));
    }
    if frame_len < 1 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame too short: missing type byte",
        ));
    }

    let mut frame = BytesMut::zeroed(frame_len as usize);
    reader.read_exact(&mut frame).await?;
    let mut frame = frame.freeze();
    let msg_type = frame[0];
    let body = frame.split_off(1);
    Ok(Some((msg_type, body)))
}

/// Write one pre-encoded frame to the stream.
pub async fn write_frame<W: AsyncWriteExt + Unpin>(writer: &mut W, frame: &[u8]) -> std::io::Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Encode a complete envelope frame, length prefix included.
pub fn encode_envelope(peer: ClientId, target: TargetId, payload: &[u8]) -> Bytes {
    let frame_len = 1 + ENVELOPE_HEADER_LEN + payload.len();
    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32(frame_len as u32);
    out.put_u8(MSG_ENVELOPE);
    out.put_u32_le(peer.get());
    out.put_slice(target.as_bytes());
    out.put_slice(payload);
    out.freeze()
}

/// Split an envelope body into `(peer, target, payload)`.
pub fn decode_envelope(body: Bytes) -> Result<(ClientId, TargetId, Bytes)> {
    let mut r = Reader::new(body);
    let peer = ClientId::new(r.u32("frame peer")?);
    let target = TargetId::from_bytes(r.id16("frame target")?);
    Ok((peer, target, r.rest()))
}
