//! Merge Service
//!
//! The one write path for counters: validate the proposal, check the verified
//! identity claim against the owner, persist under the max-merge rule, then
//! emit the change on the feed. The service never pushes to observers itself;
//! the feed ranker owns that side.

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use tally_common::api::Identity;
use tally_common::feed::{ChangeFeed, ChangeType, CounterChange};
use tally_common::{Error, Result};
use tracing::{debug, warn};

use crate::db;

pub struct MergeService {
    pool: SqlitePool,
    feed: Arc<ChangeFeed>,
}

impl MergeService {
    pub fn new(pool: SqlitePool, feed: Arc<ChangeFeed>) -> Self {
        Self { pool, feed }
    }

    /// Merge a proposed total for `owner_id` and return the authoritative
    /// value: `max(stored, proposed)`.
    ///
    /// Max-merge makes retried and duplicated submissions idempotent and lets
    /// concurrent total-so-far submissions from different sessions converge.
    /// It is not an additive CRDT: two sessions racing with partial increments
    /// can under-count relative to the true click total. Accepted trade-off.
    pub async fn merge(
        &self,
        identity: &Identity,
        owner_id: &str,
        proposed_value: i64,
    ) -> Result<u64> {
        // Validation errors are rejected synchronously, never retried
        if proposed_value < 0 {
            return Err(Error::InvalidInput(format!(
                "proposed_value must be >= 0, got {}",
                proposed_value
            )));
        }

        // The auth collaborator verified the claim; this service only checks
        // that the claim matches the counter being written.
        if identity.actor_id != owner_id {
            warn!(
                "Identity mismatch: actor {} attempted merge for owner {}",
                identity.actor_id, owner_id
            );
            return Err(Error::Unauthorized(format!(
                "identity does not match owner {}",
                owner_id
            )));
        }

        let existed = db::owner_exists(&self.pool, owner_id).await?;
        let confirmed = db::upsert_max(
            &self.pool,
            owner_id,
            identity.display_name.as_deref(),
            proposed_value as u64,
        )
        .await?;

        debug!(
            "Merged counter for {}: proposed {}, confirmed {}",
            owner_id, proposed_value, confirmed
        );

        // Visible to the ranker via the change feed; if nobody is subscribed
        // yet (startup ordering) the ranker's snapshot load covers the gap.
        self.feed.emit_lossy(CounterChange {
            owner_id: owner_id.to_string(),
            display_name: identity.display_name.clone(),
            value: confirmed,
            event_type: if existed {
                ChangeType::Update
            } else {
                ChangeType::Insert
            },
            timestamp: Utc::now(),
        });

        Ok(confirmed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn service() -> (tempfile::TempDir, MergeService, Arc<ChangeFeed>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = db::init_database(&dir.path().join("tally.db"))
            .await
            .expect("init database");
        let feed = Arc::new(ChangeFeed::new(16));
        let svc = MergeService::new(pool, feed.clone());
        (dir, svc, feed)
    }

    fn identity(actor: &str) -> Identity {
        Identity {
            actor_id: actor.to_string(),
            display_name: Some(format!("{} display", actor)),
        }
    }

    #[tokio::test]
    async fn merge_is_idempotent_and_monotonic() {
        let (_dir, svc, _feed) = service().await;
        let id = identity("u1");

        assert_eq!(svc.merge(&id, "u1", 5).await.expect("merge"), 5);
        assert_eq!(svc.merge(&id, "u1", 5).await.expect("merge"), 5);
        assert_eq!(svc.merge(&id, "u1", 3).await.expect("merge"), 5);
        assert_eq!(svc.merge(&id, "u1", 8).await.expect("merge"), 8);
    }

    #[tokio::test]
    async fn merge_rejects_negative_proposals() {
        let (_dir, svc, _feed) = service().await;

        let err = svc.merge(&identity("u1"), "u1", -1).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn merge_rejects_identity_mismatch() {
        let (_dir, svc, _feed) = service().await;

        let err = svc.merge(&identity("mallory"), "u1", 5).await.unwrap_err();
        assert!(matches!(err, Error::Unauthorized(_)));
    }

    #[tokio::test]
    async fn merge_emits_change_feed_event() {
        let (_dir, svc, feed) = service().await;
        let mut rx = feed.subscribe();

        svc.merge(&identity("u1"), "u1", 4).await.expect("merge");
        let change = rx.try_recv().expect("change event");
        assert_eq!(change.owner_id, "u1");
        assert_eq!(change.value, 4);
        assert_eq!(change.event_type, ChangeType::Insert);

        svc.merge(&identity("u1"), "u1", 6).await.expect("merge");
        let change = rx.try_recv().expect("change event");
        assert_eq!(change.event_type, ChangeType::Update);
        assert_eq!(change.value, 6);
    }
}
