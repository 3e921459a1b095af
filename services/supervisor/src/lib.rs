//! Strata Service Supervision
//!
//! Decides how many worker instances of each logical service should run on
//! this host, and keeps the actual OS processes in line with that decision.
//!
//! - [`registry`]: service descriptors and instance records, behind one lock
//! - [`manager`]: desired-vs-actual reconciliation with admission control
//! - [`process`]: spawning, terminating, reaping and log retention
//!
//! The split mirrors the failure model: the manager only mutates records,
//! the process supervisor only acts on records, and every state transition
//! goes through the registry so a scale-down racing a cleanup pass still
//! observes one source of truth.

pub mod error;
pub mod manager;
pub mod process;
pub mod registry;

pub use error::SupervisorError;
pub use manager::{HostLimits, InstanceManager, ReconcileOutcome};
pub use process::{logfile_instance_id, ProcessSupervisor, SupervisorConfig};
pub use registry::{
    InstanceId, InstanceState, ServiceDescriptor, ServiceInstance, ServiceRegistry,
};

use tracing::warn;

/// One full supervision pass: reconcile records, start any local instance
/// that lacks a process, then reap/terminate/retire via cleanup.
///
/// Spawn failures are logged and retried on the next pass, never fatal.
pub fn sweep_once(
    manager: &InstanceManager,
    processes: &ProcessSupervisor,
    registry: &ServiceRegistry,
) -> ReconcileOutcome {
    let outcome = manager.reconcile();

    for instance in registry.instances() {
        if instance.host == manager.host() && instance.state == InstanceState::Running {
            if let Err(e) = processes.start(&instance.service, &instance.identity) {
                warn!(
                    error = %e,
                    service = %instance.service,
                    identity = %instance.identity,
                    "worker spawn failed; will retry next sweep"
                );
            }
        }
    }

    processes.cleanup(registry);
    outcome
}
