//! Verified identity extraction
//!
//! Session issuance and verification belong to the auth layer in front of
//! this core; by the time a request lands here, that layer has attached the
//! verified actor id (and optionally a display name) as request headers.
//! Handlers take a [`VerifiedIdentity`] argument instead of reading headers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tally_common::api::{Identity, ACTOR_ID_HEADER, DISPLAY_NAME_HEADER};

/// Extractor wrapper around the shared [`Identity`] claim
pub struct VerifiedIdentity(pub Identity);

#[axum::async_trait]
impl<S> FromRequestParts<S> for VerifiedIdentity
where
    S: Send + Sync,
{
    type Rejection = MissingIdentity;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let actor_id = parts
            .headers
            .get(ACTOR_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .ok_or(MissingIdentity)?
            .to_string();

        let display_name = parts
            .headers
            .get(DISPLAY_NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Ok(VerifiedIdentity(Identity {
            actor_id,
            display_name,
        }))
    }
}

/// Rejection for requests the auth layer never stamped
#[derive(Debug)]
pub struct MissingIdentity;

impl IntoResponse for MissingIdentity {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "success": false,
            "error": "Missing verified identity",
        }));
        (StatusCode::UNAUTHORIZED, body).into_response()
    }
}
