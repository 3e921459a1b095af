use anyhow::{Context, Result};
use clap::Parser;
use config::StrataConfig;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use supervisor::{
    sweep_once, HostLimits, InstanceManager, ProcessSupervisor, ServiceDescriptor,
    ServiceRegistry, SupervisorConfig,
};
use tracing::info;

/// Run the Strata service supervisor for this host.
#[derive(Parser)]
#[command(name = "strata-supervisor")]
struct Args {
    /// Configuration file path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Hostname to claim instances under (defaults to the configured host).
    #[arg(long)]
    hostname: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = StrataConfig::load(args.config.as_deref())?;
    let own_host = args.hostname.unwrap_or_else(|| cfg.host.clone());

    let registry = Arc::new(ServiceRegistry::new());
    for entry in &cfg.services {
        registry.upsert_service(ServiceDescriptor {
            name: entry.name.clone(),
            target_count: entry.target_count,
            cores: entry.cores,
            gb_ram: entry.gb_ram,
            placement: entry.placement.clone(),
        });
    }

    let manager = Arc::new(InstanceManager::new(
        registry.clone(),
        own_host.clone(),
        HostLimits {
            max_cores: cfg.supervisor.max_cores,
            max_gb_ram: cfg.supervisor.max_gb_ram,
        },
    ));
    let processes = Arc::new(
        ProcessSupervisor::new(SupervisorConfig {
            own_host,
            server_host: cfg.host.clone(),
            server_port: cfg.port,
            worker_command: cfg.supervisor.worker_command.clone(),
            logfile_directory: cfg.logfile_directory(),
            shutdown_grace: Duration::from_secs(cfg.supervisor.shutdown_grace_secs),
        })
        .context("failed to initialize the process supervisor")?,
    );

    info!(
        services = cfg.services.len(),
        sweep_interval_secs = cfg.supervisor.sweep_interval_secs,
        "supervisor started"
    );

    let mut ticker =
        tokio::time::interval(Duration::from_secs(cfg.supervisor.sweep_interval_secs.max(1)));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let manager = manager.clone();
                let processes = processes.clone();
                let registry = registry.clone();
                // Sweeps block on process waits; keep them off the runtime.
                let _ = tokio::task::spawn_blocking(move || {
                    sweep_once(&manager, &processes, &registry)
                })
                .await;
            }
        }
    }

    info!("shutdown requested");
    let manager_for_shutdown = manager.clone();
    let registry_for_shutdown = registry.clone();
    let processes_for_shutdown = processes.clone();
    let _ = tokio::task::spawn_blocking(move || {
        manager_for_shutdown.stop_all_services();
        processes_for_shutdown.shutdown(&registry_for_shutdown)
    })
    .await;

    Ok(())
}
