//! The two contracts the networking core consumes from the storage engine,
//! and the in-memory implementation behind the `memory` backend.
//!
//! The real transaction/storage engine is an external collaborator; the
//! server only needs "apply an inbound message" and "release a dropped
//! connection's state". `MemoryStore` implements enough of those to back
//! tests and single-host deployments.

use parking_lot::Mutex;
use protocol::{key_space, ClientRequest, ConnectionId, FieldWrite, ServerEvent};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// One outgoing message produced by applying an inbound one.
#[derive(Debug)]
pub struct Outbound {
    pub target: ConnectionId,
    pub event: ServerEvent,
}

impl Outbound {
    pub fn new(target: ConnectionId, event: ServerEvent) -> Self {
        Self { target, event }
    }
}

/// Contract between the connection registry and the storage engine.
pub trait Store: Send + Sync + 'static {
    /// Apply one inbound message to database state, returning the outgoing
    /// messages the state change produces. Runs on the event loop; must not
    /// block.
    fn apply(&self, source: ConnectionId, request: ClientRequest) -> Vec<Outbound>;

    /// Release all state associated with a dropped connection
    /// (subscriptions etc.). Idempotent.
    fn connection_dropped(&self, source: ConnectionId);
}

/// Volatile key/value store with per-space subscription fanout.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    values: BTreeMap<String, Vec<u8>>,
    subscribers: HashMap<String, Vec<ConnectionId>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a key, for tests and diagnostics.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().values.get(key).cloned()
    }
}

impl Store for MemoryStore {
    fn apply(&self, source: ConnectionId, request: ClientRequest) -> Vec<Outbound> {
        match request {
            // Liveness is the registry's concern; nothing to apply.
            ClientRequest::Heartbeat => Vec::new(),

            ClientRequest::Subscribe { space } => {
                let mut state = self.state.lock();
                let subscribers = state.subscribers.entry(space.clone()).or_default();
                if !subscribers.contains(&source) {
                    subscribers.push(source);
                }
                debug!(%source, %space, "subscription added");

                // Initial snapshot of everything already in the space.
                let values: Vec<FieldWrite> = state
                    .values
                    .iter()
                    .filter(|(key, _)| key_space(key) == space)
                    .map(|(key, value)| FieldWrite::set(key.clone(), value.clone()))
                    .collect();
                vec![Outbound::new(
                    source,
                    ServerEvent::SubscriptionData { space, values },
                )]
            }

            ClientRequest::Transaction { id, writes } => {
                let mut state = self.state.lock();

                let mut per_space: BTreeMap<String, Vec<FieldWrite>> = BTreeMap::new();
                for write in &writes {
                    match &write.value {
                        Some(value) => {
                            state.values.insert(write.key.clone(), value.clone());
                        }
                        None => {
                            state.values.remove(&write.key);
                        }
                    }
                    per_space
                        .entry(write.space().to_string())
                        .or_default()
                        .push(write.clone());
                }

                let mut out = Vec::new();
                for (space, values) in per_space {
                    if let Some(subscribers) = state.subscribers.get(&space) {
                        for target in subscribers {
                            out.push(Outbound::new(
                                *target,
                                ServerEvent::SubscriptionData {
                                    space: space.clone(),
                                    values: values.clone(),
                                },
                            ));
                        }
                    }
                }
                out.push(Outbound::new(
                    source,
                    ServerEvent::TransactionResponse {
                        id,
                        success: true,
                        message: None,
                    },
                ));
                out
            }
        }
    }

    fn connection_dropped(&self, source: ConnectionId) {
        let mut state = self.state.lock();
        for subscribers in state.subscribers.values_mut() {
            subscribers.retain(|c| *c != source);
        }
        state.subscribers.retain(|_, subscribers| !subscribers.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writes_of(event: &ServerEvent) -> &[FieldWrite] {
        match event {
            ServerEvent::SubscriptionData { values, .. } => values,
            other => panic!("expected SubscriptionData, got {other:?}"),
        }
    }

    #[test]
    fn subscribe_returns_the_current_snapshot() {
        let store = MemoryStore::new();
        let writer = ConnectionId(1);
        let watcher = ConnectionId(2);

        store.apply(
            writer,
            ClientRequest::Transaction {
                id: 1,
                writes: vec![
                    FieldWrite::set("services/foo", b"3".to_vec()),
                    FieldWrite::set("hosts/a", b"up".to_vec()),
                ],
            },
        );

        let out = store.apply(
            watcher,
            ClientRequest::Subscribe {
                space: "services".into(),
            },
        );
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, watcher);
        let snapshot = writes_of(&out[0].event);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].key, "services/foo");
    }

    #[test]
    fn transaction_fans_out_to_subscribers_and_responds_to_the_source() {
        let store = MemoryStore::new();
        let writer = ConnectionId(1);
        let watcher = ConnectionId(2);

        store.apply(
            watcher,
            ClientRequest::Subscribe {
                space: "services".into(),
            },
        );
        let out = store.apply(
            writer,
            ClientRequest::Transaction {
                id: 9,
                writes: vec![FieldWrite::set("services/foo", b"1".to_vec())],
            },
        );

        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, watcher);
        assert_eq!(writes_of(&out[0].event)[0].key, "services/foo");
        assert_eq!(out[1].target, writer);
        assert!(matches!(
            out[1].event,
            ServerEvent::TransactionResponse {
                id: 9,
                success: true,
                ..
            }
        ));
    }

    #[test]
    fn deletes_remove_keys() {
        let store = MemoryStore::new();
        let conn = ConnectionId(1);
        store.apply(
            conn,
            ClientRequest::Transaction {
                id: 1,
                writes: vec![FieldWrite::set("a/b", b"x".to_vec())],
            },
        );
        store.apply(
            conn,
            ClientRequest::Transaction {
                id: 2,
                writes: vec![FieldWrite::delete("a/b")],
            },
        );
        assert_eq!(store.get("a/b"), None);
    }

    #[test]
    fn dropped_connections_stop_receiving_fanout() {
        let store = MemoryStore::new();
        let writer = ConnectionId(1);
        let watcher = ConnectionId(2);

        store.apply(
            watcher,
            ClientRequest::Subscribe {
                space: "services".into(),
            },
        );
        store.connection_dropped(watcher);

        let out = store.apply(
            writer,
            ClientRequest::Transaction {
                id: 1,
                writes: vec![FieldWrite::set("services/foo", b"1".to_vec())],
            },
        );
        // Only the writer's own response remains.
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].target, writer);
    }
}
