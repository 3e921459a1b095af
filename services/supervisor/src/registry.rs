//! Service descriptors and instance records.
//!
//! The registry stands in for the store-backed service schema: one table of
//! descriptors (what operators want) and one of instances (what the manager
//! has decided), behind a single lock held only for the duration of a
//! mutation. State transitions are compare-and-swap shaped: callers learn
//! whether *their* call performed the transition, so concurrent
//! reconciliation and cleanup passes never act on stale reads.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// Collision-free identity of one running copy of a service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operator-declared description of a logical service. Read-only to the
/// instance manager; mutated through `set_target`/`upsert_service`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub target_count: u32,
    /// Cores one instance consumes, for admission control.
    pub cores: u32,
    /// RAM in GB one instance consumes, for admission control.
    pub gb_ram: u32,
    /// Pin instances to a specific host.
    pub placement: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Running,
    /// Marked for shutdown; the process supervisor terminates it once the
    /// grace period elapses.
    ShutdownRequested,
}

#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub identity: InstanceId,
    pub service: String,
    pub host: String,
    pub state: InstanceState,
    pub shutdown_requested_at: Option<Instant>,
    /// Creation order, for newest-first scale-down.
    pub(crate) seq: u64,
}

#[derive(Default)]
struct RegistryState {
    services: HashMap<String, ServiceDescriptor>,
    instances: HashMap<InstanceId, ServiceInstance>,
    next_seq: u64,
}

/// Single source of truth for desired and decided service state.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<RegistryState>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_service(&self, descriptor: ServiceDescriptor) {
        self.inner
            .write()
            .services
            .insert(descriptor.name.clone(), descriptor);
    }

    /// Change a service's desired instance count. Returns false for an
    /// unknown service.
    pub fn set_target(&self, service: &str, target_count: u32) -> bool {
        match self.inner.write().services.get_mut(service) {
            Some(descriptor) => {
                descriptor.target_count = target_count;
                true
            }
            None => false,
        }
    }

    pub fn service(&self, name: &str) -> Option<ServiceDescriptor> {
        self.inner.read().services.get(name).cloned()
    }

    pub fn services(&self) -> Vec<ServiceDescriptor> {
        self.inner.read().services.values().cloned().collect()
    }

    /// Record the decision to run a new instance on `host`.
    pub fn create_instance(&self, service: &str, host: &str) -> InstanceId {
        let identity = InstanceId::generate();
        let mut state = self.inner.write();
        state.next_seq += 1;
        let seq = state.next_seq;
        state.instances.insert(
            identity.clone(),
            ServiceInstance {
                identity: identity.clone(),
                service: service.to_string(),
                host: host.to_string(),
                state: InstanceState::Running,
                shutdown_requested_at: None,
                seq,
            },
        );
        identity
    }

    /// Transition an instance to shutdown-requested. Returns true only for
    /// the caller that performed the transition.
    pub fn request_shutdown(&self, identity: &InstanceId, now: Instant) -> bool {
        match self.inner.write().instances.get_mut(identity) {
            Some(instance) if instance.state == InstanceState::Running => {
                instance.state = InstanceState::ShutdownRequested;
                instance.shutdown_requested_at = Some(now);
                true
            }
            _ => false,
        }
    }

    /// Remove an instance record. Idempotent.
    pub fn remove_instance(&self, identity: &InstanceId) -> bool {
        self.inner.write().instances.remove(identity).is_some()
    }

    pub fn instance(&self, identity: &InstanceId) -> Option<ServiceInstance> {
        self.inner.read().instances.get(identity).cloned()
    }

    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.inner.read().instances.values().cloned().collect()
    }

    pub fn instances_of(&self, service: &str) -> Vec<ServiceInstance> {
        self.inner
            .read()
            .instances
            .values()
            .filter(|i| i.service == service)
            .cloned()
            .collect()
    }

    pub fn instances_on(&self, host: &str) -> Vec<ServiceInstance> {
        self.inner
            .read()
            .instances
            .values()
            .filter(|i| i.host == host)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(name: &str, target: u32) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            target_count: target,
            cores: 1,
            gb_ram: 1,
            placement: None,
        }
    }

    #[test]
    fn request_shutdown_transitions_exactly_once() {
        let registry = ServiceRegistry::new();
        registry.upsert_service(descriptor("foo", 1));
        let id = registry.create_instance("foo", "host-a");

        let now = Instant::now();
        assert!(registry.request_shutdown(&id, now));
        // The loser of the race observes that someone else already did it.
        assert!(!registry.request_shutdown(&id, now));

        let instance = registry.instance(&id).unwrap();
        assert_eq!(instance.state, InstanceState::ShutdownRequested);
        assert!(instance.shutdown_requested_at.is_some());
    }

    #[test]
    fn remove_instance_is_idempotent() {
        let registry = ServiceRegistry::new();
        let id = registry.create_instance("foo", "host-a");
        assert!(registry.remove_instance(&id));
        assert!(!registry.remove_instance(&id));
        assert!(registry.instance(&id).is_none());
    }

    #[test]
    fn identities_do_not_collide() {
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            assert!(seen.insert(InstanceId::generate()));
        }
    }

    #[test]
    fn set_target_rejects_unknown_services() {
        let registry = ServiceRegistry::new();
        assert!(!registry.set_target("ghost", 2));
        registry.upsert_service(descriptor("foo", 1));
        assert!(registry.set_target("foo", 2));
        assert_eq!(registry.service("foo").unwrap().target_count, 2);
    }
}
