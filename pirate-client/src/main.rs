//! # Pirate Radio Client
//!
//! Boots the Sync Kernel for this device: bootstraps a bearer token and
//! a session (create-as-DJ or join-as-listener) against the
//! coordinator's REST surface, connects the WebSocket transport, and
//! serves a local SSE control surface for UI consumers.
//!
//! The vendor playback binding is a `MockMusicSource` pending a real
//! provider SDK adapter (the spec treats the music player as an
//! abstract, pluggable capability; see `adapter::MusicSource`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod adapter;
mod api;
mod config;
mod error;
mod kernel;
mod session_store;
mod transport;

use crate::adapter::{MockMusicSource, MusicSourceDriver};
use crate::config::Config;
use crate::kernel::SyncKernel;
use crate::session_store::SessionStore;
use crate::transport::{connect_with_backoff, Transport, WsTransport};

use pirate_common::auth::{TokenCache, DEFAULT_REFRESH_MARGIN_MS, DEFAULT_TTL_MS};
use pirate_common::clock::SystemClock;

#[derive(Parser, Debug)]
#[command(name = "pirate-client")]
#[command(about = "Pirate Radio client: synchronized playback for one device")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "pirate-client.toml")]
    config: PathBuf,

    /// Local control-surface HTTP port (overrides config file)
    #[arg(short, long)]
    port: Option<u16>,

    /// Coordinator REST base URL (overrides config file)
    #[arg(long)]
    coordinator_http_url: Option<String>,

    /// Coordinator WebSocket base URL (overrides config file)
    #[arg(long)]
    coordinator_ws_url: Option<String>,

    /// Display name shown to other session members
    #[arg(short, long)]
    display_name: Option<String>,

    /// Four-digit join code; omit to create a new session as its DJ
    #[arg(short, long)]
    join_code: Option<String>,
}

#[derive(serde::Serialize)]
struct AuthRequest {
    #[serde(rename = "spotifyUserId")]
    user_id: String,
    #[serde(rename = "displayName")]
    display_name: String,
}

#[derive(serde::Deserialize)]
struct AuthResponse {
    token: String,
}

#[derive(serde::Serialize)]
struct CreateSessionRequest {}

#[derive(serde::Deserialize)]
struct CreateSessionResponse {
    id: String,
    #[serde(rename = "joinCode")]
    join_code: String,
}

#[derive(serde::Serialize)]
struct JoinSessionRequest {
    code: String,
}

#[derive(serde::Deserialize)]
struct JoinSessionResponse {
    id: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pirate_client=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true).with_file(true).with_line_number(true))
        .init();

    info!("Starting Pirate Radio client");

    let args = Args::parse();
    let config = Config::load(
        &args.config,
        args.port,
        args.coordinator_http_url,
        args.coordinator_ws_url,
        args.display_name,
        args.join_code,
    )
    .context("loading client configuration")?;

    let local_user_id = uuid::Uuid::new_v4().to_string();
    let http_client = reqwest::Client::new();
    let bootstrap_clock = SystemClock::new();

    // Cached across the REST bootstrap calls and the WebSocket upgrade
    // below so rapid user actions (create, then immediately join another
    // session) never burst `/auth` round trips (see the design note on
    // token caching).
    let token_cache = TokenCache::new(DEFAULT_REFRESH_MARGIN_MS);
    let token = token_cache
        .get_or_refresh::<_, _, anyhow::Error>(&bootstrap_clock, || async {
            let auth: AuthResponse = http_client
                .post(format!("{}/auth", config.coordinator_http_url))
                .json(&AuthRequest { user_id: local_user_id.clone(), display_name: config.display_name.clone() })
                .send()
                .await
                .context("bootstrapping auth token")?
                .json()
                .await
                .context("decoding auth response")?;
            Ok((auth.token, DEFAULT_TTL_MS))
        })
        .await?;

    let session_id = match &config.join_code {
        Some(code) => {
            let resp: JoinSessionResponse = http_client
                .post(format!("{}/sessions/join", config.coordinator_http_url))
                .bearer_auth(&token)
                .json(&JoinSessionRequest { code: code.clone() })
                .send()
                .await
                .context("joining session")?
                .json()
                .await
                .context("decoding join response")?;
            resp.id
        }
        None => {
            let resp: CreateSessionResponse = http_client
                .post(format!("{}/sessions", config.coordinator_http_url))
                .bearer_auth(&token)
                .json(&CreateSessionRequest {})
                .send()
                .await
                .context("creating session")?
                .json()
                .await
                .context("decoding create-session response")?;
            info!(join_code = %resp.join_code, "created session as DJ");
            resp.id
        }
    };

    let (ws_transport, incoming_rx, mut decode_failure_rx) = WsTransport::new(config.coordinator_ws_url.clone());
    let ws_transport = Arc::new(ws_transport);
    tokio::spawn({
        let ws_transport = Arc::clone(&ws_transport);
        let session_id = session_id.clone();
        async move { connect_with_backoff(&ws_transport, &session_id, &token).await }
    });
    tokio::spawn(async move {
        while let Some(failure) = decode_failure_rx.recv().await {
            error!(raw = %failure.raw, reason = %failure.reason, "decode failure on inbound frame");
        }
    });
    let transport: Arc<dyn Transport> = ws_transport;

    let (source, mut vendor_callbacks) = MockMusicSource::new(Duration::from_millis(50), false);
    let adapter = Arc::new(MusicSourceDriver::new(source, config.sync.watchdog_ms));
    tokio::spawn({
        let adapter = Arc::clone(&adapter);
        async move {
            while let Some((track_id, dispatch_time)) = vendor_callbacks.recv().await {
                adapter.on_playback_started(&track_id, dispatch_time).await;
            }
        }
    });

    let clock = Arc::new(SystemClock::new());
    let kernel = SyncKernel::new(config.sync, clock, transport, adapter, local_user_id.clone());
    kernel.spawn(incoming_rx);

    let session_store = SessionStore::new(kernel, local_user_id);
    session_store.spawn();

    info!(port = config.port, "starting local control surface");
    api::server::run(config.port, session_store).await?;

    Ok(())
}
