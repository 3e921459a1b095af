//! Desired-vs-actual reconciliation per service.
//!
//! The manager only mutates records: it creates instance records up to the
//! target (subject to host resource admission) and marks excess instances
//! shutdown-requested, newest first. It never touches processes; killing is
//! the process supervisor's job once the grace period elapses.

use crate::registry::{InstanceState, ServiceInstance, ServiceRegistry};
use crate::InstanceId;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Aggregate resource budget for one host.
#[derive(Debug, Clone, Copy)]
pub struct HostLimits {
    pub max_cores: u32,
    pub max_gb_ram: u32,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            max_cores: 4,
            max_gb_ram: 4,
        }
    }
}

/// What one reconciliation pass decided.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub created: Vec<InstanceId>,
    pub shutdown_requested: Vec<InstanceId>,
    /// Instances wanted but deferred by admission control.
    pub deferred: usize,
}

impl ReconcileOutcome {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.shutdown_requested.is_empty()
    }
}

pub struct InstanceManager {
    registry: Arc<ServiceRegistry>,
    host: String,
    limits: HostLimits,
}

impl InstanceManager {
    pub fn new(registry: Arc<ServiceRegistry>, host: impl Into<String>, limits: HostLimits) -> Self {
        Self {
            registry,
            host: host.into(),
            limits,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Bring decided instance counts in line with targets. Idempotent:
    /// a second pass with unchanged targets decides nothing new.
    pub fn reconcile(&self) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let now = Instant::now();

        // Every instance still on the books holds its resources; a
        // shutdown-requested worker keeps its cores until its process is gone.
        let (mut used_cores, mut used_gb_ram) = self.resources_in_use();

        for descriptor in self.registry.services() {
            if let Some(placement) = &descriptor.placement {
                if placement != &self.host {
                    continue;
                }
            }

            let mut live: Vec<ServiceInstance> = self
                .registry
                .instances_of(&descriptor.name)
                .into_iter()
                .filter(|i| i.host == self.host && i.state == InstanceState::Running)
                .collect();
            let target = descriptor.target_count as usize;

            if live.len() < target {
                for _ in live.len()..target {
                    if used_cores + descriptor.cores > self.limits.max_cores
                        || used_gb_ram + descriptor.gb_ram > self.limits.max_gb_ram
                    {
                        warn!(
                            service = %descriptor.name,
                            used_cores,
                            used_gb_ram,
                            "admission control deferred instance creation"
                        );
                        outcome.deferred += 1;
                        break;
                    }
                    let identity = self.registry.create_instance(&descriptor.name, &self.host);
                    info!(service = %descriptor.name, %identity, "instance created");
                    used_cores += descriptor.cores;
                    used_gb_ram += descriptor.gb_ram;
                    outcome.created.push(identity);
                }
            } else if live.len() > target {
                let excess = live.len() - target;
                live.sort_by(|a, b| b.seq.cmp(&a.seq));
                for instance in live.iter().take(excess) {
                    if self.registry.request_shutdown(&instance.identity, now) {
                        info!(
                            service = %descriptor.name,
                            identity = %instance.identity,
                            "instance marked for shutdown"
                        );
                        outcome.shutdown_requested.push(instance.identity.clone());
                    }
                }
            } else {
                debug!(service = %descriptor.name, count = target, "service at target");
            }
        }

        // Instances whose descriptor disappeared have no target to serve.
        for instance in self.registry.instances_on(&self.host) {
            if instance.state == InstanceState::Running
                && self.registry.service(&instance.service).is_none()
                && self.registry.request_shutdown(&instance.identity, now)
            {
                warn!(
                    service = %instance.service,
                    identity = %instance.identity,
                    "service descriptor gone, shutting instance down"
                );
                outcome.shutdown_requested.push(instance.identity.clone());
            }
        }

        outcome
    }

    /// Set every target to zero and request shutdown of everything local.
    pub fn stop_all_services(&self) {
        let now = Instant::now();
        for descriptor in self.registry.services() {
            self.registry.set_target(&descriptor.name, 0);
        }
        for instance in self.registry.instances_on(&self.host) {
            self.registry.request_shutdown(&instance.identity, now);
        }
        info!("all services stopped");
    }

    fn resources_in_use(&self) -> (u32, u32) {
        let mut cores = 0;
        let mut gb_ram = 0;
        for instance in self.registry.instances_on(&self.host) {
            if let Some(descriptor) = self.registry.service(&instance.service) {
                cores += descriptor.cores;
                gb_ram += descriptor.gb_ram;
            }
        }
        (cores, gb_ram)
    }
}
