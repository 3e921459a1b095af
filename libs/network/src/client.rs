//! The blocking client-side façade over a connection endpoint.
//!
//! `Session` is what application threads hold: `connect` blocks until the
//! handshake completes, `transact` is request/response keyed by transaction
//! id, and `subscribe` returns a feed the caller drains at its own pace.
//! Every call is safe from any thread; the work is marshalled through the
//! endpoint's outbound queue onto the event loop.
//!
//! A session does not auto-reconnect. On `Disconnected`, every in-flight
//! request fails and the feeds end; reconnection is caller policy.

use crate::endpoint::ClientEndpoint;
use crate::error::{NetError, Result};
use crate::reactor::ReactorHandle;
use crate::NetConfig;
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use protocol::{ClientRequest, ConnectionId, FieldWrite, ServerEvent, TransactionId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Result of a committed (or refused) transaction.
#[derive(Debug, Clone)]
pub struct TransactionOutcome {
    pub success: bool,
    pub message: Option<String>,
}

/// One batch of changes delivered to a subscription feed.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub space: String,
    pub values: Vec<FieldWrite>,
}

/// Thread-safe handle to one live connection. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").finish_non_exhaustive()
    }
}

struct SessionInner {
    endpoint: ClientEndpoint,
    connection_id: OnceLock<ConnectionId>,
    init: Mutex<Option<Sender<Result<ConnectionId>>>>,
    pending: Mutex<HashMap<TransactionId, Sender<Result<TransactionOutcome>>>>,
    subscriptions: Mutex<HashMap<String, Sender<SubscriptionUpdate>>>,
    next_txn: AtomicU64,
}

impl SessionInner {
    /// Fail everything in flight with `Disconnected` and end the feeds.
    /// Draining under the locks makes a second invocation a no-op.
    fn fail_all_inflight(&self) {
        if let Some(init) = self.init.lock().take() {
            let _ = init.send(Err(NetError::Disconnected));
        }
        let pending: Vec<_> = self.pending.lock().drain().collect();
        for (_, sender) in pending {
            let _ = sender.send(Err(NetError::Disconnected));
        }
        self.subscriptions.lock().clear();
    }
}

impl Session {
    /// Establish a connection with default tuning. See [`Session::connect_with`].
    pub fn connect(
        handle: &ReactorHandle,
        host: &str,
        port: u16,
        timeout: Duration,
        retry: bool,
    ) -> Result<Session> {
        Self::connect_with(handle, host, port, timeout, retry, NetConfig::default())
    }

    /// Establish a connection, blocking the calling thread until the
    /// handshake completes or `timeout` elapses.
    ///
    /// With `retry`, refused attempts back off exponentially from
    /// `timeout / 100` (at least 10ms) up to `timeout`, until the budget is
    /// spent. Without it, the first refusal is surfaced immediately.
    pub fn connect_with(
        handle: &ReactorHandle,
        host: &str,
        port: u16,
        timeout: Duration,
        retry: bool,
        config: NetConfig,
    ) -> Result<Session> {
        let started = Instant::now();
        let floor = (timeout / 100).max(Duration::from_millis(10));
        let mut wait = floor;

        let (endpoint, handler_slot) = loop {
            let remaining = timeout.saturating_sub(started.elapsed());
            if remaining.is_zero() {
                return Err(NetError::timeout("connect", timeout));
            }

            let host_owned = host.to_string();
            let attempt_config = config.clone();
            let attempt = handle.run_with_timeout("connect", remaining, async move {
                ClientEndpoint::connect(&host_owned, port, &attempt_config).await
            });

            match attempt {
                Ok(Ok(pair)) => break pair,
                Ok(Err(io_err)) => {
                    let err = NetError::from_connect(&format!("{host}:{port}"), io_err);
                    if !retry {
                        return Err(err);
                    }
                    let remaining = timeout.saturating_sub(started.elapsed());
                    if remaining.is_zero() {
                        return Err(err);
                    }
                    debug!(error = %err, wait_ms = wait.as_millis() as u64, "connect failed, retrying");
                    std::thread::sleep(wait.min(remaining));
                    wait = (wait * 2).min(timeout);
                }
                // The overall budget ran out mid-attempt.
                Err(timeout_err) => return Err(timeout_err),
            }
        };

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        if handler_slot.send(event_tx).is_err() {
            // The endpoint died before the handler landed.
            return Err(NetError::Disconnected);
        }

        let (init_tx, init_rx) = bounded(1);
        let inner = Arc::new(SessionInner {
            endpoint,
            connection_id: OnceLock::new(),
            init: Mutex::new(Some(init_tx)),
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_txn: AtomicU64::new(1),
        });
        handle.spawn(dispatch_events(Arc::downgrade(&inner), event_rx));

        let remaining = timeout.saturating_sub(started.elapsed());
        match init_rx.recv_timeout(remaining.max(Duration::from_millis(1))) {
            Ok(Ok(connection_id)) => {
                debug!(%connection_id, "session connected");
                Ok(Session { inner })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NetError::internal(
                "connection established but initialization never arrived",
            )),
        }
    }

    /// Identity the server assigned at handshake.
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.inner.connection_id.get().copied()
    }

    pub fn is_connected(&self) -> bool {
        !self.inner.endpoint.is_dead()
    }

    /// Submit a batch of writes and block for the outcome.
    pub fn transact(
        &self,
        writes: Vec<FieldWrite>,
        timeout: Duration,
    ) -> Result<TransactionOutcome> {
        let id = self.inner.next_txn.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = bounded(1);
        self.inner.pending.lock().insert(id, tx);

        if let Err(e) = self
            .inner
            .endpoint
            .send(&ClientRequest::Transaction { id, writes })
        {
            self.inner.pending.lock().remove(&id);
            return Err(e);
        }

        match rx.recv_timeout(timeout) {
            Ok(outcome) => outcome,
            Err(_) => {
                self.inner.pending.lock().remove(&id);
                Err(NetError::timeout("transaction", timeout))
            }
        }
    }

    /// Subscribe to a space. The returned feed carries the initial snapshot
    /// followed by every subsequent change, and ends on disconnect.
    pub fn subscribe(&self, space: &str) -> Result<Receiver<SubscriptionUpdate>> {
        let (tx, rx) = unbounded();
        self.inner
            .subscriptions
            .lock()
            .insert(space.to_string(), tx);

        if let Err(e) = self.inner.endpoint.send(&ClientRequest::Subscribe {
            space: space.to_string(),
        }) {
            self.inner.subscriptions.lock().remove(space);
            return Err(e);
        }
        Ok(rx)
    }

    /// Close the session locally. In-flight requests fail with
    /// `Disconnected`; the connection cannot be reused.
    pub fn close(&self) {
        self.inner.endpoint.close();
        self.inner.fail_all_inflight();
    }
}

/// Routes decoded server events to their waiters. Runs on the event loop;
/// holds only a weak reference so dropping the last `Session` tears the
/// endpoint down rather than leaking it.
async fn dispatch_events(
    inner: Weak<SessionInner>,
    mut events: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = events.recv().await {
        let Some(session) = inner.upgrade() else {
            break;
        };
        match event {
            ServerEvent::Initialize {
                connection_id,
                heartbeat_ms,
            } => {
                let _ = session.connection_id.set(connection_id);
                debug!(
                    %connection_id,
                    server_heartbeat_ms = heartbeat_ms,
                    "session initialized"
                );
                if let Some(init) = session.init.lock().take() {
                    let _ = init.send(Ok(connection_id));
                }
            }
            ServerEvent::TransactionResponse {
                id,
                success,
                message,
            } => {
                if let Some(waiter) = session.pending.lock().remove(&id) {
                    let _ = waiter.send(Ok(TransactionOutcome { success, message }));
                }
            }
            ServerEvent::SubscriptionData { space, values } => {
                let mut subscriptions = session.subscriptions.lock();
                let feed_gone = match subscriptions.get(&space) {
                    Some(feed) => feed
                        .send(SubscriptionUpdate {
                            space: space.clone(),
                            values,
                        })
                        .is_err(),
                    None => false,
                };
                if feed_gone {
                    subscriptions.remove(&space);
                }
            }
            ServerEvent::Disconnected => {
                debug!("session disconnected");
                session.fail_all_inflight();
                break;
            }
            ServerEvent::Error { message } => {
                warn!(%message, "server reported a connection error");
            }
        }
    }
}
