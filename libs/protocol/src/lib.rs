//! Strata Wire Protocol
//!
//! The closed message vocabulary exchanged between a Strata client and the
//! database server, plus the frame codec that moves it over a byte stream.
//!
//! ## What This Crate Contains
//! - `ClientRequest` / `ServerEvent`: the versioned, closed sum of every
//!   message either side may produce
//! - Frame encoding/decoding (magic, version, length prefix, bincode body)
//! - Protocol-level error types
//!
//! ## What This Crate Does NOT Contain
//! - Socket management or connection handling (belongs in network/)
//! - Database transaction semantics (external to this core)
//!
//! Every dispatch site matches exhaustively on the message enums, so adding
//! a message kind is compiler-checked across the tree.

pub mod error;
pub mod message;
pub mod wire;

pub use error::ProtocolError;
pub use message::{
    key_space, ClientRequest, ConnectionId, FieldWrite, ServerEvent, TransactionId,
};
pub use wire::{
    decode_body, encode_frame, read_frame, write_frame, DEFAULT_MAX_FRAME_BYTES, FRAME_HEADER_BYTES,
    FRAME_MAGIC, PROTOCOL_VERSION,
};
