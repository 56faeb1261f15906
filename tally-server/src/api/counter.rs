//! Counter mutation endpoint

use axum::extract::State;
use axum::Json;
use tally_common::api::{MergeRequest, MergeResponse};

use super::{ApiError, VerifiedIdentity};
use crate::AppState;

/// POST /api/counter
///
/// Submits a proposed total for the caller's counter and returns the
/// authoritative value after the max-merge. Validation failures are 400,
/// identity mismatches 403, persistence failures 500.
pub async fn merge_counter(
    State(state): State<AppState>,
    VerifiedIdentity(identity): VerifiedIdentity,
    Json(request): Json<MergeRequest>,
) -> Result<Json<MergeResponse>, ApiError> {
    let confirmed = state
        .merge
        .merge(&identity, &request.owner_id, request.proposed_value)
        .await?;

    Ok(Json(MergeResponse::ok(confirmed)))
}
