//! tally-server library - realtime counter synchronization core
//!
//! Wires the four halves of the core together: the Merge Service (the one
//! counter write path), the change feed it emits into, the Feed Ranker that
//! derives the live leaderboard from the feed, and the progress hub that fans
//! background-work progress out to push observers.

use axum::routing::{get, post};
use axum::Router;
use sqlx::SqlitePool;
use std::sync::Arc;
use tally_common::feed::ChangeFeed;
use tower_http::cors::CorsLayer;

pub mod api;
pub mod db;
pub mod merge;
pub mod progress;
pub mod ranker;

use merge::MergeService;
use progress::ProgressHub;
use ranker::RankerHandle;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Counter store pool
    pub db: SqlitePool,
    /// Change feed between the merge service and the ranker
    pub feed: Arc<ChangeFeed>,
    /// The one counter write path
    pub merge: Arc<MergeService>,
    /// Read side of the feed ranker
    pub ranker: RankerHandle,
    /// Progress broadcast sessions
    pub progress: ProgressHub,
}

impl AppState {
    pub fn new(
        db: SqlitePool,
        feed: Arc<ChangeFeed>,
        merge: Arc<MergeService>,
        ranker: RankerHandle,
        progress: ProgressHub,
    ) -> Self {
        Self {
            db,
            feed,
            merge,
            ranker,
            progress,
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health endpoint (no identity claim required)
        .route("/health", get(api::health_check))
        // Counter mutation (requires verified identity)
        .route("/api/counter", post(api::merge_counter))
        // Leaderboard reads
        .route("/api/leaderboard", get(api::get_leaderboard))
        .route("/api/leaderboard/events", get(api::leaderboard_events))
        // Progress push stream
        .route("/api/progress/events", get(api::progress_events))
        .with_state(state)
        // Enable CORS for local access
        .layer(CorsLayer::permissive())
}
