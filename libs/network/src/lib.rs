//! Strata Network Infrastructure
//!
//! The connection core of the Strata store: one cooperative event loop owns
//! every socket, while application threads cross into it through thread-safe
//! submission primitives.
//!
//! - [`reactor`]: the event loop as an explicit object (no ambient globals)
//! - [`endpoint`]: the client side of a framed, heartbeating connection
//! - [`server`]: listener, connection registry and dead-peer sweep
//! - [`client`]: the blocking `Session` façade used by application threads
//! - [`store`]: the two contracts the networking core consumes from the
//!   storage engine, plus the in-memory implementation

pub mod client;
pub mod endpoint;
pub mod error;
pub mod reactor;
pub mod server;
pub mod store;

pub use client::{Session, SubscriptionUpdate, TransactionOutcome};
pub use endpoint::ClientEndpoint;
pub use error::{NetError, Result};
pub use reactor::{Reactor, ReactorHandle};
pub use server::{ConnectionRegistry, Server};
pub use store::{MemoryStore, Outbound, Store};

use std::time::Duration;

// Constants for configuration
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_DEAD_MULTIPLIER: u32 = 2;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Tuning shared by both sides of the connection protocol.
#[derive(Debug, Clone)]
pub struct NetConfig {
    /// Heartbeat cadence H. Clients send on this interval; the server sweeps
    /// on it.
    pub heartbeat: Duration,
    /// A connection is dead once its heartbeat age exceeds
    /// `heartbeat * dead_multiplier`.
    pub dead_multiplier: u32,
    /// Upper bound on a single wire frame.
    pub max_frame_bytes: usize,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            heartbeat: DEFAULT_HEARTBEAT_INTERVAL,
            dead_multiplier: DEFAULT_DEAD_MULTIPLIER,
            max_frame_bytes: protocol::DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl NetConfig {
    /// Age past which a silent peer is considered dead.
    pub fn dead_threshold(&self) -> Duration {
        self.heartbeat * self.dead_multiplier.max(1)
    }
}
