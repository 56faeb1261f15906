//! Reconciler Queue
//!
//! Optimistic client-side counter state reconciled against server truth.
//! Two separate fields carry the two roles: `confirmed` is the last value the
//! server acknowledged, `pending` is the delta of unacknowledged local
//! increments. They are combined only at read time (`displayed()`), so the
//! display can never silently exceed what the server could produce from the
//! known pending delta, and a reconnect resync corrects it downward for free.
//!
//! One background flush task per owner submits the outstanding delta as a
//! proposed total. Increments arriving while a flush is in flight accumulate
//! and ride the next flush instead of spawning concurrent requests. Failed
//! flushes keep the delta and retry on a Fibonacci backoff schedule; any
//! success resets the schedule.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tally_common::BackoffPolicy;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::transport::MergeTransport;

/// Minimum retry delay
const BACKOFF_MIN: Duration = Duration::from_millis(200);

/// Retry delay cap
const BACKOFF_MAX: Duration = Duration::from_millis(5000);

#[derive(Debug, Default)]
struct QueueState {
    /// Last server-acknowledged value
    confirmed: u64,
    /// Unacknowledged local increments
    pending: u64,
    /// A flush is currently on the wire
    in_flight: bool,
    /// Last surfaced (non-retryable or still-failing) error
    last_error: Option<String>,
}

struct Inner {
    owner_id: String,
    transport: Arc<dyn MergeTransport>,
    policy: BackoffPolicy,
    state: Mutex<QueueState>,
    wake: Notify,
}

/// Per-owner optimistic update queue with batched reconciliation
pub struct ReconcilerQueue {
    inner: Arc<Inner>,
    flusher: JoinHandle<()>,
}

impl ReconcilerQueue {
    /// Create a queue flushing through `transport` with the default
    /// Fibonacci backoff (200 ms seed, 5 s cap).
    pub fn new(owner_id: impl Into<String>, transport: Arc<dyn MergeTransport>) -> Self {
        Self::with_policy(
            owner_id,
            transport,
            BackoffPolicy::fibonacci(BACKOFF_MIN, BACKOFF_MAX),
        )
    }

    pub fn with_policy(
        owner_id: impl Into<String>,
        transport: Arc<dyn MergeTransport>,
        policy: BackoffPolicy,
    ) -> Self {
        let inner = Arc::new(Inner {
            owner_id: owner_id.into(),
            transport,
            policy,
            state: Mutex::new(QueueState::default()),
            wake: Notify::new(),
        });
        let flusher = tokio::spawn(flush_loop(inner.clone()));
        Self { inner, flusher }
    }

    /// Record one local increment and update the optimistic display
    /// immediately. Triggers a flush unless one is already in flight.
    pub fn record_local_increment(&self) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.pending += 1;
        }
        self.inner.wake.notify_one();
    }

    /// UI-visible counter value: confirmed + pending
    pub fn displayed(&self) -> u64 {
        let state = self.inner.state.lock().unwrap();
        state.confirmed + state.pending
    }

    /// Last server-acknowledged value
    pub fn confirmed(&self) -> u64 {
        self.inner.state.lock().unwrap().confirmed
    }

    /// Outstanding unacknowledged delta
    pub fn pending(&self) -> u64 {
        self.inner.state.lock().unwrap().pending
    }

    /// Whether a flush is currently on the wire
    pub fn in_flight(&self) -> bool {
        self.inner.state.lock().unwrap().in_flight
    }

    /// Last surfaced error, if the most recent flush attempt failed
    pub fn last_error(&self) -> Option<String> {
        self.inner.state.lock().unwrap().last_error.clone()
    }

    /// Adopt an authoritative server value after a reconnect.
    ///
    /// The display becomes `value + pending`: corrected downward when local
    /// state was stale, and the still-outstanding delta is resubmitted
    /// against the fresh base.
    pub fn sync_from_server(&self, value: u64) {
        {
            let mut state = self.inner.state.lock().unwrap();
            state.confirmed = value;
        }
        self.inner.wake.notify_one();
    }
}

impl Drop for ReconcilerQueue {
    fn drop(&mut self) {
        // The backoff timer must not outlive its owner
        self.flusher.abort();
    }
}

async fn flush_loop(inner: Arc<Inner>) {
    let mut backoff = inner.policy.start();

    loop {
        inner.wake.notified().await;

        // Drain until no pending delta remains
        loop {
            let (proposed, flushed) = {
                let mut state = inner.state.lock().unwrap();
                if state.pending == 0 {
                    state.in_flight = false;
                    break;
                }
                state.in_flight = true;
                (state.confirmed + state.pending, state.pending)
            };

            match inner.transport.submit(&inner.owner_id, proposed).await {
                Ok(confirmed) => {
                    let mut state = inner.state.lock().unwrap();
                    state.confirmed = confirmed;
                    state.pending = state.pending.saturating_sub(flushed);
                    state.last_error = None;
                    backoff.reset();
                    debug!(
                        "Flushed {} for {}: confirmed {}, {} still pending",
                        flushed, inner.owner_id, confirmed, state.pending
                    );
                    // Increments that arrived mid-flight ride the next pass
                }
                Err(e) if e.is_retryable() => {
                    let delay = backoff.next_delay();
                    warn!(
                        "Flush failed for {} ({}); retrying full delta in {:?}",
                        inner.owner_id, e, delay
                    );
                    inner.state.lock().unwrap().last_error = Some(e.to_string());
                    tokio::time::sleep(delay).await;
                    // The full outstanding delta is resubmitted
                }
                Err(e) => {
                    // Validation/authorization rejection: surfaced, never
                    // retried. The delta stays put so nothing is silently
                    // dropped; the embedding app decides what to do next.
                    warn!("Flush rejected for {}: {}", inner.owner_id, e);
                    let mut state = inner.state.lock().unwrap();
                    state.last_error = Some(e.to_string());
                    state.in_flight = false;
                    break;
                }
            }
        }
    }
}
