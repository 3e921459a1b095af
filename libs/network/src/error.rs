//! Connection-layer error types.
//!
//! The taxonomy mirrors what callers can act on: refusals and timeouts are
//! retryable connect failures, `Disconnected` ends a session, and a
//! `Protocol` violation tears down the offending connection only.

use protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for connection operations.
pub type Result<T> = std::result::Result<T, NetError>;

#[derive(Debug, Error)]
pub enum NetError {
    /// No listener at the target address.
    #[error("connection refused: {addr}")]
    ConnectionRefused { addr: String },

    /// A bounded wait exceeded its budget.
    #[error("timeout: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The peer dropped mid-session. Surfaced to every pending request on
    /// the session; the session is not auto-healed.
    #[error("connection disconnected")]
    Disconnected,

    /// Malformed or unrecognized wire data. Fatal to the connection it
    /// arrived on, never to the process.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Transport-level failure.
    #[error("i/o failure: {message}")]
    Io {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// An invariant the networking core relies on did not hold.
    #[error("internal invariant violated: {message}")]
    Internal { message: String },
}

impl NetError {
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    pub fn io(message: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            message: message.into(),
            source,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Map a connect-time i/o failure, surfacing refusals distinctly.
    pub fn from_connect(addr: &str, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::ConnectionRefused {
            Self::ConnectionRefused {
                addr: addr.to_string(),
            }
        } else {
            Self::io(format!("failed to connect to {addr}"), source)
        }
    }
}
