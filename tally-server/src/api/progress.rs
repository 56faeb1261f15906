//! Progress push endpoint

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tracing::info;

use crate::AppState;

/// GET /api/progress/events
///
/// Long-lived SSE stream of progress frames, `data: <json>` only. The stream
/// ends after the terminal `done: true` frame or on client disconnect; there
/// is no error status mid-stream, failures are stream termination. The
/// subscription guard moves into the stream, so tearing the stream down
/// deregisters the session synchronously, pacer included.
pub async fn progress_events(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.progress.subscribe();
    info!(
        "Progress observer {} connected ({} sessions)",
        subscription.id(),
        state.progress.session_count()
    );

    let stream = async_stream::stream! {
        while let Some(frame) = subscription.recv().await {
            let done = frame.done;
            if let Ok(event) = Event::default().json_data(&frame) {
                yield Ok::<_, Infallible>(event);
            }
            if done {
                break;
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    )
}
