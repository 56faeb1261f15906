//! Shared API request/response types
//!
//! Wire types used by both the server endpoints and the client reconciler:
//! counter mutation request/response, progress frames, ranked leaderboard
//! entries, and the verified identity claim the auth layer attaches to
//! requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Header carrying the verified actor id, set by the auth layer in front of
/// the core. Handlers never read it directly; the `Identity` extractor does.
pub const ACTOR_ID_HEADER: &str = "x-tally-actor";

/// Optional header carrying the actor's display name
pub const DISPLAY_NAME_HEADER: &str = "x-tally-display-name";

// ========================================
// Counter mutation endpoint
// ========================================

/// POST /api/counter request body
///
/// `proposed_value` is the caller's total-so-far, not an increment. It is
/// deserialized as a signed integer so a negative proposal is rejected by
/// validation (client error class) rather than by the JSON layer.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MergeRequest {
    /// Owner the counter belongs to; must equal the verified caller identity
    pub owner_id: String,

    /// Proposed total value (must be >= 0)
    pub proposed_value: i64,
}

/// POST /api/counter response body
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MergeResponse {
    pub success: bool,

    /// Authoritative value after the merge (present on success)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_count: Option<u64>,

    /// Error description (present on failure)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MergeResponse {
    pub fn ok(new_count: u64) -> Self {
        Self {
            success: true,
            new_count: Some(new_count),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            new_count: None,
            error: Some(error.into()),
        }
    }
}

// ========================================
// Progress broadcast
// ========================================

/// One progress frame delivered over the push stream
///
/// `progress` is a fraction in [0, 1]. `done` is present (true) on exactly
/// the terminal frame of a stream.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ProgressFrame {
    pub progress: f64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub done: bool,
}

impl ProgressFrame {
    pub fn initial() -> Self {
        Self {
            progress: 0.0,
            stage: None,
            done: false,
        }
    }

    pub fn terminal(stage: Option<String>) -> Self {
        Self {
            progress: 1.0,
            stage,
            done: true,
        }
    }
}

// ========================================
// Leaderboard view
// ========================================

/// One row of the ranked leaderboard view (derived, never stored)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RankedEntry {
    /// Owner id
    pub id: String,
    /// Label shown to observers; falls back to the owner id
    pub display_name: String,
    /// Authoritative counter value
    pub value: u64,
    /// Dense 1-based rank, ordered by value descending
    pub rank: u32,
}

/// Direction of a rank change between two consecutive recomputations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RankDirection {
    Up,
    Down,
}

/// Rank movement hint for observers that only re-render deltas
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RankMovement {
    pub id: String,
    pub direction: RankDirection,
}

/// One leaderboard update pushed to every connected observer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LeaderboardUpdate {
    pub entries: Vec<RankedEntry>,
    pub movements: Vec<RankMovement>,
    pub timestamp: DateTime<Utc>,
}

// ========================================
// Identity claim
// ========================================

/// Verified identity claim attached to a request by the (external) auth layer
///
/// The core trusts this claim as-is; issuing and verifying sessions is the
/// auth collaborator's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub actor_id: String,
    pub display_name: Option<String>,
}
