//! Leaderboard read endpoints: REST snapshot and SSE push stream

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use chrono::Utc;
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tally_common::api::{LeaderboardUpdate, RankedEntry};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{info, warn};

use crate::AppState;

/// GET /api/leaderboard
///
/// Current ranked view snapshot, for observers that poll instead of
/// subscribing.
pub async fn get_leaderboard(State(state): State<AppState>) -> Json<Vec<RankedEntry>> {
    Json(state.ranker.current().as_ref().clone())
}

/// GET /api/leaderboard/events
///
/// SSE stream of leaderboard updates. Opens with the current full view so a
/// new observer renders immediately, then pushes every recomputation. Lagged
/// observers miss intermediate updates but always converge on the next one,
/// because every update carries the full ranked list.
pub async fn leaderboard_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("New leaderboard observer connected");

    let snapshot = state.ranker.current();
    let updates = state.ranker.subscribe_updates();

    let stream = async_stream::stream! {
        let initial = LeaderboardUpdate {
            entries: snapshot.as_ref().clone(),
            movements: Vec::new(),
            timestamp: Utc::now(),
        };
        if let Ok(event) = Event::default().event("LeaderboardUpdate").json_data(&initial) {
            yield Ok::<_, Infallible>(event);
        }

        let mut updates = BroadcastStream::new(updates);
        while let Some(item) = updates.next().await {
            match item {
                Ok(update) => {
                    if let Ok(event) =
                        Event::default().event("LeaderboardUpdate").json_data(&update)
                    {
                        yield Ok(event);
                    }
                }
                Err(e) => {
                    // Lagged observer; the next update re-syncs it in full
                    warn!("Leaderboard observer lagged: {:?}", e);
                }
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
