//! Strata Configuration
//!
//! Provides configuration loading for the Strata server and supervisor.
//! Supports TOML files with `STRATA_`-prefixed environment overrides.

use anyhow::{Context, Result};
use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Top-level configuration for a Strata host.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StrataConfig {
    /// Address the server binds and workers connect back to.
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Store backend selector.
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub network: NetworkSection,

    #[serde(default)]
    pub supervisor: SupervisorSection,

    /// Services this host should run, loaded into the service registry at
    /// supervisor startup.
    #[serde(default)]
    pub services: Vec<ServiceEntry>,
}

/// Which storage engine backs the server.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Volatile in-process store.
    Memory,
    /// External persistent engine, addressed by connection URL.
    Persistent { url: String },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory
    }
}

/// Connection-protocol tuning.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct NetworkSection {
    /// Heartbeat cadence H in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,

    /// A connection is dead once its heartbeat age exceeds
    /// `heartbeat_ms * dead_multiplier`.
    #[serde(default = "default_dead_multiplier")]
    pub dead_multiplier: u32,

    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,

    /// Budget for `Session::connect` and worker connect-back.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for NetworkSection {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            dead_multiplier: default_dead_multiplier(),
            max_frame_bytes: default_max_frame_bytes(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

/// Process-supervision settings for this host.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SupervisorSection {
    /// Aggregate core budget across all instances on this host.
    #[serde(default = "default_max_cores")]
    pub max_cores: u32,

    /// Aggregate RAM budget in GB across all instances on this host.
    #[serde(default = "default_max_gb_ram")]
    pub max_gb_ram: u32,

    /// Directory for per-instance log files. When absent, worker
    /// stdout/stderr are inherited rather than redirected.
    #[serde(default)]
    pub logfile_directory: Option<String>,

    /// Delay between requesting shutdown of an instance and forcibly
    /// terminating its process.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// Cadence of the reconcile/cleanup sweep.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    /// Worker program and fixed leading arguments; the supervisor appends
    /// `(host, port, instance-identity)`.
    #[serde(default = "default_worker_command")]
    pub worker_command: Vec<String>,
}

impl Default for SupervisorSection {
    fn default() -> Self {
        Self {
            max_cores: default_max_cores(),
            max_gb_ram: default_max_gb_ram(),
            logfile_directory: None,
            shutdown_grace_secs: default_shutdown_grace_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            worker_command: default_worker_command(),
        }
    }
}

/// One logical service this host should run.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceEntry {
    pub name: String,

    #[serde(default)]
    pub target_count: u32,

    /// Cores one instance of this service consumes.
    #[serde(default = "default_instance_cores")]
    pub cores: u32,

    /// RAM in GB one instance of this service consumes.
    #[serde(default = "default_instance_gb_ram")]
    pub gb_ram: u32,

    /// Pin instances of this service to a specific host.
    #[serde(default)]
    pub placement: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_heartbeat_ms() -> u64 {
    5000
}
fn default_dead_multiplier() -> u32 {
    2
}
fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_connect_timeout_secs() -> u64 {
    10
}
fn default_max_cores() -> u32 {
    4
}
fn default_max_gb_ram() -> u32 {
    4
}
fn default_shutdown_grace_secs() -> u64 {
    10
}
fn default_sweep_interval_secs() -> u64 {
    2
}
fn default_worker_command() -> Vec<String> {
    vec!["worker".to_string()]
}
fn default_instance_cores() -> u32 {
    1
}
fn default_instance_gb_ram() -> u32 {
    1
}

impl Default for StrataConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            store: StoreConfig::default(),
            network: NetworkSection::default(),
            supervisor: SupervisorSection::default(),
            services: Vec::new(),
        }
    }
}

impl StrataConfig {
    /// Load configuration from a TOML file with `STRATA_` environment
    /// overrides (`STRATA_NETWORK__HEARTBEAT_MS=1000` etc.).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let base = path.unwrap_or(Path::new("config/strata.toml"));

        let mut builder = Config::builder();
        if base.exists() {
            info!("Loading configuration from {:?}", base);
            builder = builder.add_source(File::from(base).required(true));
        } else if path.is_some() {
            anyhow::bail!("configuration file not found: {:?}", base);
        } else {
            warn!("No configuration file at {:?}, using defaults", base);
        }

        builder = builder.add_source(
            Environment::with_prefix("STRATA")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build().context("Failed to build configuration")?;

        let mut parsed: StrataConfig = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        parsed.expand_paths()?;
        Ok(parsed)
    }

    /// Expand `~` and environment variables in configured paths.
    pub fn expand_paths(&mut self) -> Result<()> {
        if let Some(dir) = &self.supervisor.logfile_directory {
            let expanded = shellexpand::full(dir).context("Failed to expand logfile directory")?;
            self.supervisor.logfile_directory = Some(expanded.to_string());
        }
        if let Some(program) = self.supervisor.worker_command.first().cloned() {
            let expanded = shellexpand::full(&program).context("Failed to expand worker command")?;
            self.supervisor.worker_command[0] = expanded.to_string();
        }
        Ok(())
    }

    pub fn logfile_directory(&self) -> Option<PathBuf> {
        self.supervisor.logfile_directory.as_ref().map(PathBuf::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn load_full_config() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("strata.toml");

        let config_content = r#"
host = "10.0.0.5"
port = 9123

[store]
backend = "persistent"
url = "redis://localhost:6379"

[network]
heartbeat_ms = 1000
dead_multiplier = 3

[supervisor]
max_cores = 8
max_gb_ram = 16
logfile_directory = "/var/log/strata"
shutdown_grace_secs = 5

[[services]]
name = "ingest"
target_count = 3
cores = 2

[[services]]
name = "compactor"
target_count = 1
placement = "db-host-2"
"#;

        fs::write(&config_path, config_content).unwrap();

        let config = StrataConfig::load(Some(&config_path)).unwrap();

        assert_eq!(config.host, "10.0.0.5");
        assert_eq!(config.port, 9123);
        assert_eq!(
            config.store,
            StoreConfig::Persistent {
                url: "redis://localhost:6379".to_string()
            }
        );
        assert_eq!(config.network.heartbeat_ms, 1000);
        assert_eq!(config.network.dead_multiplier, 3);
        assert_eq!(config.network.max_frame_bytes, 16 * 1024 * 1024);
        assert_eq!(config.supervisor.max_cores, 8);
        assert_eq!(
            config.logfile_directory(),
            Some(PathBuf::from("/var/log/strata"))
        );

        assert_eq!(config.services.len(), 2);
        assert_eq!(config.services[0].name, "ingest");
        assert_eq!(config.services[0].target_count, 3);
        assert_eq!(config.services[0].cores, 2);
        assert_eq!(config.services[0].gb_ram, 1);
        assert_eq!(config.services[1].placement.as_deref(), Some("db-host-2"));
    }

    #[test]
    fn defaults_when_sections_absent() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("strata.toml");
        fs::write(&config_path, "port = 4000\n").unwrap();

        let config = StrataConfig::load(Some(&config_path)).unwrap();

        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 4000);
        assert_eq!(config.store, StoreConfig::Memory);
        assert_eq!(config.network.heartbeat_ms, 5000);
        assert_eq!(config.network.dead_multiplier, 2);
        assert_eq!(config.supervisor.max_cores, 4);
        assert_eq!(config.supervisor.shutdown_grace_secs, 10);
        assert!(config.logfile_directory().is_none());
        assert!(config.services.is_empty());
    }

    #[test]
    fn missing_explicit_path_is_an_error() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(StrataConfig::load(Some(&missing)).is_err());
    }

    #[test]
    fn logfile_directory_env_expansion() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("strata.toml");
        std::env::set_var("STRATA_TEST_LOG_ROOT", dir.path().to_str().unwrap());
        fs::write(
            &config_path,
            "[supervisor]\nlogfile_directory = \"$STRATA_TEST_LOG_ROOT/logs\"\n",
        )
        .unwrap();

        let config = StrataConfig::load(Some(&config_path)).unwrap();
        assert_eq!(config.logfile_directory(), Some(dir.path().join("logs")));
    }
}
