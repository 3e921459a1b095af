//! Message vocabulary for the client/server connection protocol.
//!
//! Messages are immutable once constructed and carry only primitive,
//! serializable payloads. A message is created by the sender and consumed
//! exactly once by the receiving endpoint's handler.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque connection identity assigned by the server at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Client-allocated transaction identifier, unique per session.
pub type TransactionId = u64;

/// A single keyed write. `value: None` deletes the key.
///
/// The portion of the key before the first `/` is the subscription space the
/// write belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldWrite {
    pub key: String,
    pub value: Option<Vec<u8>>,
}

impl FieldWrite {
    pub fn set(key: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    /// Subscription space this write belongs to.
    pub fn space(&self) -> &str {
        key_space(&self.key)
    }
}

/// Subscription space of a key: the portion before the first `/`.
pub fn key_space(key: &str) -> &str {
    match key.find('/') {
        Some(idx) => &key[..idx],
        None => key,
    }
}

/// Everything a client may send to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientRequest {
    /// Periodic liveness signal. Carries no payload; the server tracks the
    /// receipt time per connection.
    Heartbeat,
    /// Apply a batch of writes atomically.
    Transaction {
        id: TransactionId,
        writes: Vec<FieldWrite>,
    },
    /// Ask to receive `SubscriptionData` for every change in `space`.
    Subscribe { space: String },
}

/// Everything the server may deliver to a client session.
///
/// `Disconnected` is never written to the wire by the server; the client-side
/// endpoint synthesizes it exactly once when the transport dies. It lives in
/// the union so every dispatch site handles it exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerEvent {
    /// Handshake completion: the server has registered the connection and
    /// assigned its identity. `heartbeat_ms` is the cadence the server
    /// expects liveness signals at.
    Initialize {
        connection_id: ConnectionId,
        heartbeat_ms: u64,
    },
    /// Outcome of a previously submitted transaction.
    TransactionResponse {
        id: TransactionId,
        success: bool,
        message: Option<String>,
    },
    /// State change (or initial snapshot) for a subscribed space.
    SubscriptionData {
        space: String,
        values: Vec<FieldWrite>,
    },
    /// Synthesized client-side when the transport is lost.
    Disconnected,
    /// Server-side failure that is fatal to this connection only.
    Error { message: String },
}
