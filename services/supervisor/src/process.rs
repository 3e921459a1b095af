//! Worker process supervision: spawn, log, terminate, reap.
//!
//! One OS process per service instance, keyed by instance identity. The
//! handle map sits behind one lock that is never held across a blocking
//! wait; liveness reads use non-blocking `try_wait`. Termination is
//! SIGTERM, a bounded wait, then SIGKILL, so every stop path returns.

use crate::error::SupervisorError;
use crate::registry::{InstanceId, InstanceState, ServiceRegistry};
use chrono::{DateTime, Local};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Hostname this supervisor claims instances under.
    pub own_host: String,
    /// Server address passed to workers so they can connect back.
    pub server_host: String,
    pub server_port: u16,
    /// Worker program and fixed leading arguments; `(host, port, identity)`
    /// are appended at spawn.
    pub worker_command: Vec<String>,
    /// When absent, worker stdout/stderr are inherited rather than
    /// redirected.
    pub logfile_directory: Option<PathBuf>,
    /// Delay between a shutdown request and forcible termination.
    pub shutdown_grace: Duration,
}

/// Handle to one spawned worker. At most one exists per live instance
/// identity.
pub struct WorkerProcessHandle {
    child: Child,
    pub pid: u32,
    pub log_path: Option<PathBuf>,
    pub started_at: DateTime<Local>,
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
    handles: Mutex<HashMap<InstanceId, WorkerProcessHandle>>,
}

fn timestamp_for_filename(now: DateTime<Local>) -> String {
    now.format("%Y%m%d_%H%M%S_%3f").to_string()
}

/// Instance identity encoded in a worker logfile name, if any.
pub fn logfile_instance_id(name: &str) -> Option<InstanceId> {
    let stem = name.strip_suffix(".log.txt")?;
    let (_, identity) = stem.rsplit_once('-')?;
    if identity.is_empty() {
        None
    } else {
        Some(InstanceId::from_string(identity))
    }
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Result<Self, SupervisorError> {
        if config.worker_command.is_empty() {
            return Err(SupervisorError::EmptyWorkerCommand);
        }
        if let Some(dir) = &config.logfile_directory {
            fs::create_dir_all(dir).map_err(|source| SupervisorError::LogDirectory {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(Self {
            config,
            handles: Mutex::new(HashMap::new()),
        })
    }

    /// Spawn a worker for `identity`. No-op if a process already exists for
    /// that identity.
    pub fn start(&self, service: &str, identity: &InstanceId) -> Result<(), SupervisorError> {
        if self.handles.lock().contains_key(identity) {
            return Ok(());
        }

        let started_at = Local::now();
        let (stdout, stderr, log_path) = match &self.config.logfile_directory {
            Some(dir) => {
                let name = format!(
                    "{service}-{}-{identity}.log.txt",
                    timestamp_for_filename(started_at)
                );
                let path = dir.join(name);
                let file = fs::File::create(&path).map_err(|source| SupervisorError::Logfile {
                    path: path.clone(),
                    source,
                })?;
                // stderr shares the file so the log carries both streams.
                let stderr_file =
                    file.try_clone()
                        .map_err(|source| SupervisorError::Logfile {
                            path: path.clone(),
                            source,
                        })?;
                (Stdio::from(file), Stdio::from(stderr_file), Some(path))
            }
            None => (Stdio::inherit(), Stdio::inherit(), None),
        };

        let mut command = Command::new(&self.config.worker_command[0]);
        command
            .args(&self.config.worker_command[1..])
            .arg(&self.config.server_host)
            .arg(self.config.server_port.to_string())
            .arg(identity.as_str())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        let child = command.spawn().map_err(|source| SupervisorError::Spawn {
            service: service.to_string(),
            source,
        })?;
        let pid = child.id();

        let mut handles = self.handles.lock();
        if handles.contains_key(identity) {
            // Lost a start race for this identity; at most one process may
            // own it.
            drop(handles);
            let mut extra = child;
            let _ = extra.kill();
            let _ = extra.wait();
            return Ok(());
        }
        handles.insert(
            identity.clone(),
            WorkerProcessHandle {
                child,
                pid,
                log_path: log_path.clone(),
                started_at,
            },
        );
        drop(handles);

        match log_path {
            Some(path) => info!(
                service,
                %identity,
                pid,
                log = %path.display(),
                "started service worker"
            ),
            None => info!(service, %identity, pid, "started service worker"),
        }
        Ok(())
    }

    /// Terminate one worker and block for its exit. Returns false if no
    /// process exists for the identity.
    pub fn stop(&self, identity: &InstanceId) -> bool {
        let Some(handle) = self.handles.lock().remove(identity) else {
            return false;
        };
        self.terminate(handle);
        true
    }

    pub fn pid_of(&self, identity: &InstanceId) -> Option<u32> {
        self.handles.lock().get(identity).map(|h| h.pid)
    }

    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn managed_identities(&self) -> Vec<InstanceId> {
        self.handles.lock().keys().cloned().collect()
    }

    /// Periodic sweep:
    /// 1. reap exited workers and retire their instance records, so the
    ///    reconciler can replace them;
    /// 2. force-terminate workers whose shutdown request outlived the grace
    ///    period, removing their records;
    /// 3. move logfiles with no live handle into `old/`.
    pub fn cleanup(&self, registry: &ServiceRegistry) {
        for identity in self.reap_exited() {
            if registry.remove_instance(&identity) {
                info!(%identity, "reaped exited worker");
            }
        }

        let now = Instant::now();
        for instance in registry.instances_on(&self.config.own_host) {
            if instance.state != InstanceState::ShutdownRequested {
                continue;
            }
            let grace_expired = instance
                .shutdown_requested_at
                .map(|at| now.saturating_duration_since(at) >= self.config.shutdown_grace)
                .unwrap_or(true);
            if !grace_expired {
                continue;
            }

            // Take the handle in its own statement so the guard drops
            // before the blocking wait in terminate.
            let handle = self.handles.lock().remove(&instance.identity);
            if let Some(handle) = handle {
                warn!(
                    identity = %instance.identity,
                    pid = handle.pid,
                    "grace period expired, terminating worker"
                );
                self.terminate(handle);
            }
            registry.remove_instance(&instance.identity);
        }

        self.cleanup_old_logfiles();
    }

    /// Move logfiles belonging to identities with no current handle into the
    /// `old/` subdirectory. Files for in-flight workers stay put.
    pub fn cleanup_old_logfiles(&self) {
        let Some(dir) = &self.config.logfile_directory else {
            return;
        };
        let handles = self.handles.lock();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(error = %e, dir = %dir.display(), "cannot list logfile directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            let Some(identity) = logfile_instance_id(&name) else {
                continue;
            };
            if handles.contains_key(&identity) {
                continue;
            }

            let old_dir = dir.join("old");
            if let Err(e) = fs::create_dir_all(&old_dir) {
                warn!(error = %e, "cannot create old-logfile directory");
                return;
            }
            match fs::rename(entry.path(), old_dir.join(&name)) {
                Ok(()) => debug!(file = %name, "retired logfile"),
                Err(e) => warn!(error = %e, file = %name, "failed to retire logfile"),
            }
        }
    }

    /// Stop everything: request shutdown of all local instances, give them
    /// the grace period collectively, then force-kill and reap the rest.
    pub fn shutdown(&self, registry: &ServiceRegistry) {
        info!("supervisor shutting down");
        let now = Instant::now();
        for instance in registry.instances_on(&self.config.own_host) {
            registry.request_shutdown(&instance.identity, now);
        }

        // Graceful phase: ask every worker to stop, then poll for exits.
        let pids: Vec<u32> = self.handles.lock().values().map(|h| h.pid).collect();
        for pid in pids {
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        let deadline = Instant::now() + self.config.shutdown_grace;
        loop {
            for identity in self.reap_exited() {
                registry.remove_instance(&identity);
            }
            if self.handles.lock().is_empty() || Instant::now() >= deadline {
                break;
            }
            std::thread::sleep(Duration::from_millis(25));
        }

        // Force phase.
        let remaining: Vec<(InstanceId, WorkerProcessHandle)> =
            self.handles.lock().drain().collect();
        for (identity, mut handle) in remaining {
            warn!(%identity, pid = handle.pid, "worker survived the grace period, killing");
            let _ = handle.child.kill();
            let _ = handle.child.wait();
            registry.remove_instance(&identity);
        }
        info!("supervisor stopped");
    }

    /// Non-blocking poll for exited workers; removes and returns their
    /// identities.
    fn reap_exited(&self) -> Vec<InstanceId> {
        let mut handles = self.handles.lock();
        let exited: Vec<InstanceId> = handles
            .iter_mut()
            .filter_map(|(identity, handle)| match handle.child.try_wait() {
                Ok(Some(_)) => Some(identity.clone()),
                Ok(None) => None,
                Err(e) => {
                    warn!(%identity, error = %e, "could not poll worker");
                    None
                }
            })
            .collect();
        for identity in &exited {
            handles.remove(identity);
        }
        exited
    }

    /// SIGTERM, bounded wait, then SIGKILL. Called with the handle already
    /// out of the map, so no lock is held across the wait.
    fn terminate(&self, mut handle: WorkerProcessHandle) {
        let pid = Pid::from_raw(handle.pid as i32);
        if let Err(e) = kill(pid, Signal::SIGTERM) {
            debug!(pid = handle.pid, error = %e, "SIGTERM failed, process likely gone");
        }
        if wait_with_deadline(
            &mut handle.child,
            Instant::now() + self.config.shutdown_grace,
        )
        .is_none()
        {
            warn!(pid = handle.pid, "worker ignored SIGTERM, killing");
            let _ = handle.child.kill();
            let _ = handle.child.wait();
        }
    }
}

fn wait_with_deadline(child: &mut Child, deadline: Instant) -> Option<ExitStatus> {
    loop {
        if let Ok(Some(status)) = child.try_wait() {
            return Some(status);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}
