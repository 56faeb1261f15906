//! tally-server - realtime counter synchronization and broadcast core
//!
//! Hosts the counter merge endpoint, the live leaderboard (snapshot + SSE
//! push), and the progress broadcast stream.

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tally_common::config;
use tally_common::feed::ChangeFeed;
use tally_server::{build_router, merge::MergeService, progress::ProgressHub, ranker, AppState};
use tracing::info;

/// Buffered feed events per subscriber before lagging
const FEED_CAPACITY: usize = 256;

#[derive(Parser, Debug)]
#[command(name = "tally-server", about = "Realtime counter sync and broadcast core")]
struct Args {
    /// SQLite database path (overrides env and config file)
    #[arg(long)]
    database: Option<String>,

    /// Listen port (overrides env and config file)
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    // Log build identification immediately after tracing init
    info!(
        "Starting tally-server v{} [{}] built {} ({})",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH"),
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_PROFILE")
    );

    let args = Args::parse();

    let db_path = config::resolve_database_path(args.database.as_deref())?;
    let port = config::resolve_port(args.port)?;
    info!("Database path: {}", db_path.display());

    let pool = tally_server::db::init_database(&db_path).await?;
    info!("✓ Counter store ready");

    let feed = Arc::new(ChangeFeed::new(FEED_CAPACITY));
    let merge = Arc::new(MergeService::new(pool.clone(), feed.clone()));

    let (ranker_handle, ranker_shutdown) = ranker::spawn(pool.clone(), feed.clone());
    info!("✓ Feed ranker running");

    let progress = ProgressHub::new();
    let sweeper = progress.start_idle_sweep();

    let state = AppState::new(pool, feed, merge, ranker_handle, progress);
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("tally-server listening on http://0.0.0.0:{}", port);
    info!("Health check: http://127.0.0.1:{}/health", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    // Close the ranker state machine and the idle sweep before exit
    ranker_shutdown.shutdown().await;
    sweeper.abort();
    info!("tally-server stopped");

    Ok(())
}
