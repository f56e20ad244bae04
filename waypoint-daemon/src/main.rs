//! Waypoint daemon - hosts connected runs over HTTP.
//!
//! Runs register, stream their events through the async bus, heartbeat, and
//! suspend on approvals that operators resolve through the same API.

mod routes;
mod sse;
mod state;
mod tracker;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use chrono::Utc;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use waypoint::io::layout::WorkflowsLayout;
use waypoint::io::run_index::RunIndex;

use crate::state::AppState;

#[derive(Parser)]
#[command(name = "waypoint-daemon")]
#[command(about = "Event bus, approvals and liveness for connected workflow runs")]
struct Args {
    /// Address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    bind: String,

    /// Port to listen on
    #[arg(long, default_value = "3001")]
    port: u16,

    /// Seconds without a heartbeat before a run is marked stale
    #[arg(long, default_value = "60")]
    stale_secs: u64,

    /// Seconds between stale sweeps
    #[arg(long, default_value = "5")]
    sweep_secs: u64,

    /// Seconds a finished or stale run stays tracked before it is evicted
    #[arg(long, default_value = "3600")]
    retain_secs: u64,

    /// Workflows root whose run index records finished runs
    #[arg(long)]
    root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("waypoint_daemon=info".parse()?),
        )
        .init();

    let args = Args::parse();

    let index = args
        .root
        .as_ref()
        .map(|root| RunIndex::for_layout(&WorkflowsLayout::new(root)));
    if let Some(index) = &index {
        info!(index = %index.path().display(), "recording finished runs");
    }

    let state = AppState::new(
        Duration::from_secs(args.stale_secs),
        Duration::from_secs(args.retain_secs),
        index,
    );
    start_sweeper(state.clone(), Duration::from_secs(args.sweep_secs.max(1)));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .nest("/api", routes::api_router())
        .route("/events", get(sse::events_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", args.bind, args.port).parse()?;
    info!(addr = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Periodically mark runs whose heartbeats stopped as stale and evict runs
/// that have been quiet past the retention window.
fn start_sweeper(state: AppState, every: Duration) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(every);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            state.sweep(Utc::now());
        }
    });
}
