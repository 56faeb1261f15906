//! Feed Ranker
//!
//! Consumes the counter change feed and maintains the ranked leaderboard
//! view. A single task owns all mutation of the view; everyone else reads
//! immutable snapshots through a watch channel or receives pushed updates
//! through a broadcast channel.
//!
//! Feed consumption is an explicit state machine:
//!
//! ```text
//! Connecting -> Subscribed -> (Backoff -> Connecting)* -> Polling | Closed
//! ```
//!
//! `Connecting` loads a full snapshot then applies feed events incrementally.
//! A lagged subscription (missed events) routes back through `Connecting`;
//! ranking is recomputed from full state, so the reload is correct regardless
//! of what was missed. Snapshot failures retry with exponential
//! backoff up to a bounded attempt count, after which the ranker degrades to
//! fixed-interval polling instead of leaving the view stale.

mod view;

pub use view::{diff_movements, LeaderboardState};

use chrono::Utc;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tally_common::api::{LeaderboardUpdate, RankedEntry};
use tally_common::feed::ChangeFeed;
use tally_common::BackoffPolicy;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::db;

/// Bounded reconnect attempts before degrading to polling
const MAX_SNAPSHOT_ATTEMPTS: u32 = 5;

/// Snapshot re-poll interval in degraded mode
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Capacity of the observer-facing update channel
const UPDATE_CHANNEL_CAPACITY: usize = 64;

/// Feed consumption state, observable for diagnostics and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connecting,
    Subscribed,
    Backoff,
    Polling,
    Closed,
}

/// Read side of the ranker, cheap to clone into request handlers
#[derive(Clone)]
pub struct RankerHandle {
    snapshot: watch::Receiver<Arc<Vec<RankedEntry>>>,
    updates: broadcast::Sender<LeaderboardUpdate>,
    state: watch::Receiver<FeedState>,
}

impl RankerHandle {
    /// Current ranked view snapshot
    pub fn current(&self) -> Arc<Vec<RankedEntry>> {
        self.snapshot.borrow().clone()
    }

    /// Subscribe to pushed leaderboard updates
    pub fn subscribe_updates(&self) -> broadcast::Receiver<LeaderboardUpdate> {
        self.updates.subscribe()
    }

    /// Current feed consumption state
    pub fn state(&self) -> FeedState {
        *self.state.borrow()
    }
}

/// Owns the ranker task lifetime; kept by main, not by request handlers
pub struct RankerShutdown {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RankerShutdown {
    /// Signal the task to close and wait for it to finish
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                error!("Ranker task panicked during shutdown: {}", e);
            }
        }
    }
}

/// Spawn the ranker task
pub fn spawn(pool: SqlitePool, feed: Arc<ChangeFeed>) -> (RankerHandle, RankerShutdown) {
    let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(Vec::new()));
    let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
    let (state_tx, state_rx) = watch::channel(FeedState::Connecting);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = RankerHandle {
        snapshot: snapshot_rx,
        updates: updates_tx.clone(),
        state: state_rx,
    };

    let task = tokio::spawn(run(
        pool,
        feed,
        snapshot_tx,
        updates_tx,
        state_tx,
        shutdown_rx,
    ));

    (
        handle,
        RankerShutdown { shutdown_tx, task },
    )
}

async fn run(
    pool: SqlitePool,
    feed: Arc<ChangeFeed>,
    snapshot_tx: watch::Sender<Arc<Vec<RankedEntry>>>,
    updates_tx: broadcast::Sender<LeaderboardUpdate>,
    state_tx: watch::Sender<FeedState>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut backoff = BackoffPolicy::exponential(
        Duration::from_millis(500),
        Duration::from_secs(8),
        2,
    )
    .start();
    let mut board = LeaderboardState::new();
    let mut last_ranked: Vec<RankedEntry> = Vec::new();

    'feed: loop {
        let _ = state_tx.send(FeedState::Connecting);

        // Subscribe before the snapshot load so no merge can fall between the
        // snapshot and the first consumed event.
        let mut rx = feed.subscribe();

        match db::load_all(&pool).await {
            Ok(records) => {
                board = LeaderboardState::from_records(&records);
                publish(&board, &mut last_ranked, &snapshot_tx, &updates_tx);
                backoff.reset();
                let _ = state_tx.send(FeedState::Subscribed);
                info!("Feed ranker subscribed ({} owners)", board.len());

                loop {
                    tokio::select! {
                        _ = shutdown_rx.changed() => break 'feed,
                        change = rx.recv() => match change {
                            Ok(change) => {
                                board.apply(
                                    &change.owner_id,
                                    change.display_name.as_deref(),
                                    change.value,
                                );
                                publish(&board, &mut last_ranked, &snapshot_tx, &updates_tx);
                            }
                            Err(broadcast::error::RecvError::Lagged(missed)) => {
                                // Missed events are recovered by reloading the
                                // snapshot, not replayed.
                                warn!("Feed ranker lagged {} events, resnapshotting", missed);
                                continue 'feed;
                            }
                            Err(broadcast::error::RecvError::Closed) => {
                                info!("Change feed closed");
                                break 'feed;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                if backoff.attempts() >= MAX_SNAPSHOT_ATTEMPTS {
                    error!(
                        "Snapshot load failed after {} attempts ({}); degrading to polling",
                        backoff.attempts(),
                        e
                    );
                    poll_degraded(
                        &pool,
                        &mut board,
                        &mut last_ranked,
                        &snapshot_tx,
                        &updates_tx,
                        &state_tx,
                        &mut shutdown_rx,
                    )
                    .await;
                    break 'feed;
                }

                let delay = backoff.next_delay();
                warn!(
                    "Snapshot load failed ({}); retrying in {:?} (attempt {})",
                    e,
                    delay,
                    backoff.attempts()
                );
                let _ = state_tx.send(FeedState::Backoff);
                tokio::select! {
                    _ = shutdown_rx.changed() => break 'feed,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    let _ = state_tx.send(FeedState::Closed);
    debug!("Feed ranker closed");
}

/// Degraded-but-correct mode: fixed-interval full snapshot reload
async fn poll_degraded(
    pool: &SqlitePool,
    board: &mut LeaderboardState,
    last_ranked: &mut Vec<RankedEntry>,
    snapshot_tx: &watch::Sender<Arc<Vec<RankedEntry>>>,
    updates_tx: &broadcast::Sender<LeaderboardUpdate>,
    state_tx: &watch::Sender<FeedState>,
    shutdown_rx: &mut watch::Receiver<bool>,
) {
    let _ = state_tx.send(FeedState::Polling);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {
                match db::load_all(pool).await {
                    Ok(records) => {
                        *board = LeaderboardState::from_records(&records);
                        publish(board, last_ranked, snapshot_tx, updates_tx);
                    }
                    Err(e) => warn!("Degraded poll failed: {}", e),
                }
            }
        }
    }
}

/// Re-rank, diff, and push one update to every observer
///
/// An unchanged view (snapshot reload or redelivered event that moved
/// nothing) is not broadcast, so observers only wake for real changes.
fn publish(
    board: &LeaderboardState,
    last_ranked: &mut Vec<RankedEntry>,
    snapshot_tx: &watch::Sender<Arc<Vec<RankedEntry>>>,
    updates_tx: &broadcast::Sender<LeaderboardUpdate>,
) {
    let ranked = board.ranked();
    if ranked == *last_ranked {
        return;
    }
    let movements = diff_movements(last_ranked, &ranked);

    let _ = snapshot_tx.send(Arc::new(ranked.clone()));
    let _ = updates_tx.send(LeaderboardUpdate {
        entries: ranked.clone(),
        movements,
        timestamp: Utc::now(),
    });
    *last_ranked = ranked;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_common::api::Identity;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn setup() -> (
        tempfile::TempDir,
        SqlitePool,
        Arc<ChangeFeed>,
        RankerHandle,
        RankerShutdown,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = db::init_database(&dir.path().join("tally.db"))
            .await
            .expect("init database");
        let feed = Arc::new(ChangeFeed::new(64));
        let (handle, shutdown) = spawn(pool.clone(), feed.clone());

        // Wait out the startup snapshot so merges land on a live subscription
        let mut state = handle.state.clone();
        timeout(WAIT, async {
            while *state.borrow() != FeedState::Subscribed {
                state.changed().await.expect("state watch open");
            }
        })
        .await
        .expect("ranker subscribes");

        (dir, pool, feed, handle, shutdown)
    }

    async fn merge(
        pool: &SqlitePool,
        feed: &Arc<ChangeFeed>,
        owner: &str,
        value: i64,
    ) {
        let svc = crate::merge::MergeService::new(pool.clone(), feed.clone());
        let identity = Identity {
            actor_id: owner.to_string(),
            display_name: None,
        };
        svc.merge(&identity, owner, value).await.expect("merge");
    }

    #[tokio::test]
    async fn merge_is_observed_and_reranked() {
        let (_dir, pool, feed, handle, shutdown) = setup().await;
        let mut updates = handle.subscribe_updates();

        merge(&pool, &feed, "u1", 5).await;

        let update = timeout(WAIT, updates.recv())
            .await
            .expect("update within deadline")
            .expect("update");
        assert_eq!(update.entries.len(), 1);
        assert_eq!(update.entries[0].id, "u1");
        assert_eq!(update.entries[0].value, 5);
        assert_eq!(update.entries[0].rank, 1);

        merge(&pool, &feed, "u2", 9).await;
        let update = timeout(WAIT, updates.recv())
            .await
            .expect("update within deadline")
            .expect("update");
        assert_eq!(update.entries[0].id, "u2");
        assert_eq!(update.entries[1].id, "u1");
        assert_eq!(update.entries[1].rank, 2);

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn snapshot_load_seeds_preexisting_counters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let pool = db::init_database(&dir.path().join("tally.db"))
            .await
            .expect("init database");
        db::upsert_max(&pool, "u1", Some("Alice"), 7)
            .await
            .expect("seed");

        let feed = Arc::new(ChangeFeed::new(64));
        let (handle, shutdown) = spawn(pool.clone(), feed.clone());

        // The initial snapshot publish lands on the watch channel
        let mut snapshot = handle.snapshot.clone();
        timeout(WAIT, async {
            loop {
                if !snapshot.borrow().is_empty() {
                    return;
                }
                snapshot.changed().await.expect("watch open");
            }
        })
        .await
        .expect("snapshot within deadline");

        let current = handle.current();
        assert_eq!(current.len(), 1);
        assert_eq!(current[0].display_name, "Alice");

        shutdown.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_closes_the_state_machine() {
        let (_dir, _pool, _feed, handle, shutdown) = setup().await;

        shutdown.shutdown().await;
        assert_eq!(handle.state(), FeedState::Closed);
    }

    #[tokio::test]
    async fn movements_reach_observers() {
        let (_dir, pool, feed, handle, shutdown) = setup().await;
        let mut updates = handle.subscribe_updates();

        merge(&pool, &feed, "u1", 10).await;
        merge(&pool, &feed, "u2", 5).await;
        let _ = timeout(WAIT, updates.recv()).await.expect("u1").expect("u1");
        let _ = timeout(WAIT, updates.recv()).await.expect("u2").expect("u2");

        // u2 overtakes u1
        merge(&pool, &feed, "u2", 20).await;
        let update = timeout(WAIT, updates.recv())
            .await
            .expect("update within deadline")
            .expect("update");
        assert_eq!(update.movements.len(), 2);

        shutdown.shutdown().await;
    }
}
