//! Frame codec: length-prefixed, versioned bincode frames.
//!
//! Layout on the wire (header fields big-endian):
//!
//! ```text
//! [magic: u32][version: u8][length: u32][body: length bytes of bincode]
//! ```
//!
//! The codec is symmetric; both sides use the same framing for their
//! respective message enums.

use crate::error::ProtocolError;
use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const FRAME_MAGIC: u32 = 0x5354_5241; // "STRA"
pub const PROTOCOL_VERSION: u8 = 1;
pub const FRAME_HEADER_BYTES: usize = 9;
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024; // 16MB

/// Serialize a message into a complete frame, header included.
pub fn encode_frame<T: Serialize>(message: &T, max_frame: usize) -> Result<Vec<u8>, ProtocolError> {
    let body = bincode::serialize(message)?;
    if body.len() > max_frame {
        return Err(ProtocolError::FrameTooLarge {
            size: body.len(),
            max: max_frame,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + body.len());
    frame.extend_from_slice(&FRAME_MAGIC.to_be_bytes());
    frame.push(PROTOCOL_VERSION);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Decode a frame body. Any unrecognized tag is a protocol error, not a
/// silently ignored message.
pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ProtocolError> {
    Ok(bincode::deserialize(body)?)
}

/// Write one pre-encoded frame and flush so it transmits immediately.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and decode its body.
///
/// Returns `Ok(None)` when the peer closes the stream at a frame boundary.
/// A close in the middle of a frame body is `ProtocolError::Truncated`.
pub async fn read_frame<R, T>(reader: &mut R, max_frame: usize) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; FRAME_HEADER_BYTES];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != FRAME_MAGIC {
        return Err(ProtocolError::InvalidMagic {
            expected: FRAME_MAGIC,
            actual: magic,
        });
    }

    let version = header[4];
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            actual: version,
            supported: PROTOCOL_VERSION,
        });
    }

    let length = u32::from_be_bytes([header[5], header[6], header[7], header[8]]) as usize;
    if length > max_frame {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: max_frame,
        });
    }

    let mut body = BytesMut::with_capacity(length);
    body.resize(length, 0);
    match reader.read_exact(&mut body).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(ProtocolError::Truncated {
                context: "frame body",
            })
        }
        Err(e) => return Err(e.into()),
    }

    decode_body(&body).map(Some)
}
