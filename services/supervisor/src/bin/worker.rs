//! Worker entrypoint: one OS process per service instance.
//!
//! The supervisor launches this with `(host, port, identity)`; the worker
//! establishes its own session back to the server under that identity and
//! runs until the connection goes away.

use anyhow::Result;
use clap::Parser;
use network::{Reactor, Session};
use protocol::FieldWrite;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "worker")]
struct Args {
    /// Server host to connect back to.
    host: String,
    /// Server port.
    port: u16,
    /// Instance identity assigned by the service manager.
    identity: String,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let reactor = Reactor::spawn()?;
    let session = Session::connect(
        reactor.handle(),
        &args.host,
        args.port,
        Duration::from_secs(10),
        true,
    )?;
    info!(
        identity = %args.identity,
        connection = ?session.connection_id(),
        "worker connected"
    );

    // Announce this instance, then follow the instances space until the
    // server goes away.
    session.transact(
        vec![FieldWrite::set(
            format!("instances/{}", args.identity),
            b"up".to_vec(),
        )],
        Duration::from_secs(5),
    )?;

    let feed = session.subscribe("instances")?;
    while let Ok(update) = feed.recv() {
        debug!(
            space = %update.space,
            changes = update.values.len(),
            "state update"
        );
    }

    info!("disconnected, exiting");
    Ok(())
}
