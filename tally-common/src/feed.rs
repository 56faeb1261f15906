//! Counter change feed
//!
//! In-process stand-in for the backing store's row-change stream. Every
//! successful merge emits one [`CounterChange`]; the feed ranker consumes
//! them. Delivery is at-least-once from the consumer's point of view: a
//! subscriber that falls behind sees a lag error and must recover by
//! reloading a full snapshot, not by assuming it saw every event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::info;

/// Kind of row change behind a feed event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// First merge for this owner created the row
    Insert,
    /// Subsequent merge updated an existing row
    Update,
}

/// One row-change notification from the counter store
///
/// Ordered per owner; no ordering guarantee across owners. Consumers must be
/// idempotent under redelivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CounterChange {
    /// Owner the counter belongs to
    pub owner_id: String,
    /// Display label carried on the identity claim, if any
    pub display_name: Option<String>,
    /// Authoritative value after the merge
    pub value: u64,
    /// Insert vs update
    pub event_type: ChangeType,
    /// When the merge committed
    pub timestamp: DateTime<Utc>,
}

/// Broadcast bus carrying [`CounterChange`] events to all subscribers
///
/// Thin wrapper over `tokio::sync::broadcast`: subscribers that lag past the
/// buffer capacity receive `RecvError::Lagged` and are expected to resnapshot.
pub struct ChangeFeed {
    tx: broadcast::Sender<CounterChange>,
    capacity: usize,
}

impl ChangeFeed {
    /// Create a feed buffering up to `capacity` undelivered events per
    /// subscriber before lagging them out.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        info!("Change feed initialized with capacity {}", capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future changes. Changes emitted before subscription
    /// are not received; new subscribers load a snapshot first.
    pub fn subscribe(&self) -> broadcast::Receiver<CounterChange> {
        self.tx.subscribe()
    }

    /// Emit a change to all subscribers.
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        change: CounterChange,
    ) -> Result<usize, broadcast::error::SendError<CounterChange>> {
        self.tx.send(change)
    }

    /// Emit a change, ignoring whether anyone is listening
    pub fn emit_lossy(&self, change: CounterChange) {
        let _ = self.tx.send(change);
    }

    /// Current number of subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Configured buffer capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn change(owner: &str, value: u64) -> CounterChange {
        CounterChange {
            owner_id: owner.to_string(),
            display_name: None,
            value,
            event_type: ChangeType::Update,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn emit_delivers_to_all_subscribers() {
        let feed = ChangeFeed::new(10);
        let mut rx1 = feed.subscribe();
        let mut rx2 = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 2);

        feed.emit(change("u1", 5)).expect("emit should succeed");

        let r1 = rx1.try_recv().expect("rx1 should receive");
        let r2 = rx2.try_recv().expect("rx2 should receive");
        assert_eq!(r1.owner_id, "u1");
        assert_eq!(r2.value, 5);
    }

    #[test]
    fn emit_lossy_does_not_panic_without_subscribers() {
        let feed = ChangeFeed::new(2);
        for i in 0..10 {
            feed.emit_lossy(change("u1", i));
        }
        assert_eq!(feed.capacity(), 2);
    }

    #[test]
    fn slow_subscriber_observes_lag() {
        let feed = ChangeFeed::new(2);
        let mut rx = feed.subscribe();

        for i in 0..5 {
            feed.emit(change("u1", i)).expect("emit should succeed");
        }

        // Buffer holds only the last 2 events; the receiver must see Lagged
        // first, which is the signal to reload a snapshot.
        match rx.try_recv() {
            Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                assert!(missed > 0);
            }
            other => panic!("Expected lag, got {:?}", other),
        }
    }

    #[test]
    fn change_serializes_for_transport() {
        let json = serde_json::to_string(&change("u1", 7)).expect("serialize");
        assert!(json.contains("\"owner_id\":\"u1\""));
        assert!(json.contains("\"value\":7"));
        assert!(json.contains("\"event_type\":\"update\""));
    }
}
