//! Protocol-level errors for frame encoding and decoding.
//!
//! A `ProtocolError` on an established connection is fatal to that
//! connection only: the endpoint is torn down, the process keeps running.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame header carried the wrong magic number. Almost always means the
    /// peer is not speaking the Strata protocol at all.
    #[error("invalid frame magic: expected {expected:#010x}, got {actual:#010x}")]
    InvalidMagic { expected: u32, actual: u32 },

    /// Peer speaks a protocol revision this build does not understand.
    #[error("unsupported protocol version {actual} (this build speaks {supported})")]
    UnsupportedVersion { actual: u8, supported: u8 },

    /// Declared frame length exceeds the configured maximum.
    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    /// Transport closed mid-frame.
    #[error("stream truncated inside a frame: {context}")]
    Truncated { context: &'static str },

    /// Frame body failed to decode: unrecognized tag or malformed payload.
    /// The message set is closed, so this is a protocol error rather than a
    /// silently ignored message.
    #[error("undecodable message body: {0}")]
    Codec(#[from] bincode::Error),

    /// Transport-level failure while reading or writing a frame.
    #[error("frame i/o failed: {0}")]
    Io(#[from] std::io::Error),
}
