//! Server side: listener, connection registry and dead-peer sweep.
//!
//! The registry tracks every live client connection, dispatches inbound
//! messages to the store, and evicts peers whose heartbeats go stale. All
//! registry operations are safe to invoke concurrently with inbound
//! dispatch for other connections; a dropped connection's outbound queue is
//! never touched again (guarded by its dead flag, and removal happens
//! exactly once).

use crate::endpoint::write_loop;
use crate::error::{NetError, Result};
use crate::reactor::ReactorHandle;
use crate::store::Store;
use crate::NetConfig;
use dashmap::DashMap;
use protocol::{wire, ClientRequest, ConnectionId, ServerEvent};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

/// Bound on listener/connection establishment waits.
pub const ESTABLISH_TIMEOUT: Duration = Duration::from_secs(10);

struct ServerConnection {
    peer: SocketAddr,
    frames: mpsc::UnboundedSender<Vec<u8>>,
    dead: Arc<AtomicBool>,
    /// Milliseconds since the registry epoch at the last received heartbeat.
    last_heartbeat_ms: Arc<AtomicU64>,
    reader: Option<tokio::task::JoinHandle<()>>,
    writer: tokio::task::JoinHandle<()>,
}

/// Tracks all live client connections on the server side.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, ServerConnection>,
    next_id: AtomicU64,
    epoch: Instant,
    store: Arc<dyn Store>,
    config: NetConfig,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn Store>, config: NetConfig) -> Self {
        Self {
            connections: DashMap::new(),
            next_id: AtomicU64::new(1),
            epoch: Instant::now(),
            store,
            config,
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Register a newly accepted transport: assign its identity, complete
    /// the handshake, and start its reader/writer tasks.
    pub fn add_connection(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }

        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (read_half, write_half) = stream.into_split();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let dead = Arc::new(AtomicBool::new(false));
        let last_heartbeat_ms = Arc::new(AtomicU64::new(self.now_ms()));

        let writer = tokio::spawn(write_loop(write_half, frames_rx));

        // Handshake: identity assignment is the first frame the client sees.
        let initialize = ServerEvent::Initialize {
            connection_id: id,
            heartbeat_ms: self.config.heartbeat.as_millis() as u64,
        };
        match wire::encode_frame(&initialize, self.config.max_frame_bytes) {
            Ok(frame) => {
                let _ = frames_tx.send(frame);
            }
            Err(e) => {
                error!(%id, error = %e, "failed to encode handshake, refusing connection");
                writer.abort();
                return;
            }
        }

        // Insert before the reader starts so dispatch always finds the entry.
        self.connections.insert(
            id,
            ServerConnection {
                peer,
                frames: frames_tx,
                dead,
                last_heartbeat_ms,
                reader: None,
                writer,
            },
        );

        let registry = Arc::clone(self);
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                match wire::read_frame::<_, ClientRequest>(
                    &mut read_half,
                    registry.config.max_frame_bytes,
                )
                .await
                {
                    Ok(Some(request)) => registry.dispatch(id, request),
                    Ok(None) => {
                        debug!(%id, "client closed connection");
                        break;
                    }
                    Err(e) => {
                        warn!(%id, error = %e, "dropping connection on protocol error");
                        break;
                    }
                }
            }
            registry.drop_connection(id);
        });

        if let Some(mut entry) = self.connections.get_mut(&id) {
            entry.reader = Some(reader);
        }
        // If the entry is already gone the reader has finished on its own.

        info!(%id, %peer, "connection registered");
    }

    fn dispatch(&self, source: ConnectionId, request: ClientRequest) {
        if let ClientRequest::Heartbeat = request {
            if let Some(conn) = self.connections.get(&source) {
                conn.last_heartbeat_ms.store(self.now_ms(), Ordering::Relaxed);
                trace!(%source, "heartbeat received");
            }
            return;
        }

        for outbound in self.store.apply(source, request) {
            self.send_event(outbound.target, &outbound.event);
        }
    }

    /// Queue one event to a connection. Silently dropped if the target is
    /// gone or dying.
    pub fn send_event(&self, target: ConnectionId, event: &ServerEvent) {
        let Some(conn) = self.connections.get(&target) else {
            trace!(%target, "send to unknown connection dropped");
            return;
        };
        if conn.dead.load(Ordering::Acquire) {
            return;
        }
        match wire::encode_frame(event, self.config.max_frame_bytes) {
            Ok(frame) => {
                let _ = conn.frames.send(frame);
            }
            Err(e) => warn!(%target, error = %e, "failed to encode outbound event"),
        }
    }

    /// Remove a connection and release its state. Idempotent; exactly one
    /// caller performs the teardown.
    pub fn drop_connection(&self, id: ConnectionId) {
        let Some((_, conn)) = self.connections.remove(&id) else {
            return;
        };
        conn.dead.store(true, Ordering::Release);
        if let Some(reader) = &conn.reader {
            reader.abort();
        }
        conn.writer.abort();
        self.store.connection_dropped(id);
        info!(%id, peer = %conn.peer, "connection dropped");
    }

    /// Liveness sweep: forcibly drop every connection whose heartbeat age
    /// exceeds the dead-peer threshold. Treated identically to a
    /// transport-level disconnect.
    pub fn check_for_dead_connections(&self) {
        let threshold_ms = self.config.dead_threshold().as_millis() as u64;
        let now = self.now_ms();

        // Collect first; removal must not run under the iteration guards.
        let mut overdue = Vec::new();
        for entry in self.connections.iter() {
            let age = now.saturating_sub(entry.last_heartbeat_ms.load(Ordering::Relaxed));
            if age > threshold_ms {
                overdue.push((*entry.key(), age));
            }
        }

        for (id, age_ms) in overdue {
            warn!(%id, age_ms, threshold_ms, "heartbeat overdue, dropping dead connection");
            self.drop_connection(id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|e| *e.key()).collect()
    }
}

/// A listening Strata server: accept loop plus liveness sweep, both running
/// on the event loop.
pub struct Server {
    registry: Arc<ConnectionRegistry>,
    local_addr: SocketAddr,
    accept: tokio::task::JoinHandle<()>,
    sweep: tokio::task::JoinHandle<()>,
}

impl Server {
    /// Bind and start serving. Blocks the calling thread for listener
    /// establishment, bounded by [`ESTABLISH_TIMEOUT`].
    pub fn bind(
        handle: &ReactorHandle,
        host: &str,
        port: u16,
        store: Arc<dyn Store>,
        config: NetConfig,
    ) -> Result<Server> {
        let bind_addr = format!("{host}:{port}");
        let listener = handle
            .run_with_timeout("bind", ESTABLISH_TIMEOUT, async move {
                TcpListener::bind(bind_addr).await
            })?
            .map_err(|e| NetError::io(format!("failed to bind {host}:{port}"), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| NetError::io("failed to read listener address", e))?;

        let registry = Arc::new(ConnectionRegistry::new(store, config.clone()));

        let accept_registry = registry.clone();
        let accept = handle.spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => accept_registry.add_connection(stream, peer),
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                }
            }
        });

        let sweep_registry = registry.clone();
        let heartbeat = config.heartbeat;
        let sweep = handle.spawn(async move {
            let mut ticker = tokio::time::interval(heartbeat);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                sweep_registry.check_for_dead_connections();
            }
        });

        info!(%local_addr, "server listening");
        Ok(Server {
            registry,
            local_addr,
            accept,
            sweep,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn connection_count(&self) -> usize {
        self.registry.connection_count()
    }

    /// Stop accepting, stop the sweep, and drop every live connection.
    pub fn stop(&self) {
        self.accept.abort();
        self.sweep.abort();
        for id in self.registry.connection_ids() {
            self.registry.drop_connection(id);
        }
        info!("server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
