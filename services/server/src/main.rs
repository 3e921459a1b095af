use anyhow::{bail, Context, Result};
use clap::Parser;
use config::{StoreConfig, StrataConfig};
use network::{MemoryStore, NetConfig, Reactor, Server, Store};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Run a Strata store server.
#[derive(Parser)]
#[command(name = "strata-server")]
struct Args {
    /// Configuration file path.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the configured bind host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = StrataConfig::load(args.config.as_deref())?;
    let host = args.host.unwrap_or_else(|| cfg.host.clone());
    let port = args.port.unwrap_or(cfg.port);

    let store: Arc<dyn Store> = match &cfg.store {
        StoreConfig::Memory => Arc::new(MemoryStore::new()),
        StoreConfig::Persistent { url } => {
            // The persistent engine ships separately; refuse rather than
            // pretend to be durable.
            bail!(
                "persistent store backend ({url}) is not available in this build; \
                 use backend = \"memory\""
            );
        }
    };

    let net = NetConfig {
        heartbeat: Duration::from_millis(cfg.network.heartbeat_ms.max(1)),
        dead_multiplier: cfg.network.dead_multiplier,
        max_frame_bytes: cfg.network.max_frame_bytes,
    };

    let reactor = Reactor::spawn()?;
    let server = Server::bind(reactor.handle(), &host, port, store, net)
        .context("failed to start server")?;
    info!(addr = %server.local_addr(), "strata server running");

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    server.stop();
    drop(server);
    reactor.shutdown();
    Ok(())
}
