//! # Pirate Radio Coordinator
//!
//! Boots the authoritative session registry and serves the REST
//! bootstrap/session surface plus the WebSocket broadcast relay on one
//! port. One process serves every session; state is in-memory only
//! (persistent storage is out of scope for the core, per the spec).

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pirate_common::clock::SystemClock;
use pirate_coordinator::config::Config;
use pirate_coordinator::{lifecycle, registry::SessionRegistry};

#[derive(Parser, Debug)]
#[command(name = "pirate-coordinator")]
#[command(about = "Pirate Radio coordinator: authoritative session registry and broadcast relay")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pirate-coordinator.toml")]
    config: PathBuf,

    /// HTTP/WebSocket listen port (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Maximum members per session (overrides config file)
    #[arg(long)]
    max_members: Option<usize>,

    /// Idle session reap threshold in milliseconds (overrides config file)
    #[arg(long)]
    idle_timeout_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pirate_coordinator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_file(true).with_line_number(true))
        .init();

    info!("Starting Pirate Radio coordinator");

    let args = Args::parse();
    let config = Config::load(&args.config, args.port, args.max_members, args.idle_timeout_ms)
        .context("loading coordinator configuration")?;

    let clock = Arc::new(SystemClock::new());
    let registry = SessionRegistry::new(clock, config.sync);
    lifecycle::spawn_idle_reaper(Arc::clone(&registry));

    let app = pirate_coordinator::router(registry);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(%addr, "coordinator listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
