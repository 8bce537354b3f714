//! PeerDrop Relay Server
//!
//! A WebSocket signaling relay for peers on the same network. The server:
//! - assigns every connection a stable peer id (persisted in a cookie)
//! - announces joins and departures to every other member
//! - forwards negotiation signals between members of a room
//! - drops members that stop answering heartbeats
//!
//! Usage:
//!   peerdrop-relay [--port 3000] [--host 0.0.0.0] [--heartbeat-interval 5]

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use peerdrop::config::{HEARTBEAT_INTERVAL, MAX_MISSED_HEARTBEATS};
use peerdrop::{RelayConfig, RelayServer};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// PeerDrop Relay Server
#[derive(Parser)]
#[command(name = "peerdrop-relay")]
#[command(about = "Signaling relay for PeerDrop peer-to-peer transfers")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3000")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Seconds between heartbeat probes
    #[arg(long, default_value_t = HEARTBEAT_INTERVAL.as_secs())]
    heartbeat_interval: u64,

    /// Unanswered probes before a peer is dropped
    #[arg(long, default_value_t = MAX_MISSED_HEARTBEATS)]
    max_missed_heartbeats: u32,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) -> anyhow::Result<()> {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(format!("peerdrop={}", level).parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose)?;

    let config = RelayConfig {
        host: args.host,
        port: args.port,
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval.max(1)),
        max_missed_heartbeats: args.max_missed_heartbeats.max(1),
    };

    let server = RelayServer::bind(&config)
        .await
        .context("Failed to start relay")?;
    info!("PeerDrop Relay Server listening on ws://{}", server.local_addr()?);
    info!(
        "Heartbeat every {}s, {} missed probes allowed",
        config.heartbeat_interval.as_secs(),
        config.max_missed_heartbeats
    );

    server.run().await?;
    Ok(())
}
