//! HTTP API handlers for tally-server

pub mod counter;
pub mod health;
pub mod identity;
pub mod leaderboard;
pub mod progress;

pub use counter::merge_counter;
pub use health::health_check;
pub use identity::VerifiedIdentity;
pub use leaderboard::{get_leaderboard, leaderboard_events};
pub use progress::progress_events;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tally_common::Error;

/// Error wrapper mapping core errors onto HTTP responses
///
/// Validation and authorization failures are client error classes; everything
/// else (persistence, internal) is a server error class. Bodies carry the
/// same `{success, error}` shape the mutation endpoint promises.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized(_) => StatusCode::FORBIDDEN,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "success": false,
            "error": self.0.to_string(),
        }));

        (status, body).into_response()
    }
}
