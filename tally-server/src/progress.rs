//! Broadcast Multiplexer for progress events
//!
//! Fans one producer's `publish(fraction, stage)` calls out to every
//! registered push session. Each session tracks the last fraction it was
//! delivered; a jump larger than [`MAX_STEP`] is paced into bounded steps so
//! observers see smooth movement instead of one leap. Progress frames are not
//! durable: a dead receiver unregisters its session, nothing is retried or
//! replayed.
//!
//! Registry discipline: the session map sits behind one mutex that is never
//! held across an await point, and every broadcast round iterates a snapshot
//! of session ids, so a session removed mid-round cannot corrupt the round.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tally_common::api::ProgressFrame;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Largest fraction jump delivered in a single frame
const MAX_STEP: f64 = 0.10;

/// Delay between paced follow-up deliveries
const PACE_INTERVAL: Duration = Duration::from_millis(300);

/// Per-session frame buffer; a full buffer drops the frame (slow consumer),
/// only a closed channel kills the session
const FRAME_CHANNEL_CAPACITY: usize = 32;

/// Sessions with no delivery activity inside this window are dropped
const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the idle sweep runs
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Where a session's paced delivery is headed
#[derive(Debug, Clone)]
struct PendingTarget {
    fraction: f64,
    stage: Option<String>,
    done: bool,
}

/// One observer's live push connection plus its delivery bookkeeping
struct Session {
    tx: mpsc::Sender<ProgressFrame>,
    last_delivered: f64,
    pending: Option<PendingTarget>,
    pacer: Option<JoinHandle<()>>,
    last_activity: Instant,
}

/// Outcome of a single delivery step for one session
#[derive(Debug, PartialEq, Eq)]
enum StepOutcome {
    /// Target not yet reached; a paced follow-up is still needed
    MorePending,
    /// Target reached (or session gone); pacing can stop
    Settled,
}

struct HubInner {
    sessions: Mutex<HashMap<Uuid, Session>>,
    pace_interval: Duration,
}

impl HubInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<Uuid, Session>> {
        self.sessions.lock().unwrap()
    }

    /// Remove a session and cancel its pacer. Safe to call twice.
    fn unregister(self: &Arc<Self>, id: Uuid) {
        let removed = self.sessions().remove(&id);
        if let Some(session) = removed {
            if let Some(pacer) = session.pacer {
                pacer.abort();
            }
            debug!("Progress session {} unregistered", id);
        }
    }

    /// Deliver one bounded step toward the session's pending target.
    ///
    /// Holds the registry lock only around map access; the send itself is a
    /// non-blocking `try_send`, so no await happens under the lock.
    fn step(self: &Arc<Self>, id: Uuid) -> StepOutcome {
        let mut needs_pacer = false;
        let outcome = {
            let mut sessions = self.sessions();
            let Some(session) = sessions.get_mut(&id) else {
                return StepOutcome::Settled;
            };
            let Some(target) = session.pending.clone() else {
                return StepOutcome::Settled;
            };

            // Frames are monotone per session; a stale non-terminal target
            // below what was already delivered is dropped, not rewound.
            if target.fraction <= session.last_delivered && !target.done {
                session.pending = None;
                return StepOutcome::Settled;
            }

            let reached = session.last_delivered + MAX_STEP >= target.fraction;
            let next = if reached {
                target.fraction
            } else {
                session.last_delivered + MAX_STEP
            };

            let frame = ProgressFrame {
                progress: next,
                stage: target.stage.clone(),
                done: target.done && reached,
            };
            let terminal = frame.done;

            match session.tx.try_send(frame) {
                Ok(()) => {
                    session.last_delivered = next;
                    session.last_activity = Instant::now();
                    if reached {
                        session.pending = None;
                        if terminal {
                            // Terminal frame delivered exactly once; the
                            // session ends with it.
                            drop(sessions);
                            self.unregister(id);
                            return StepOutcome::Settled;
                        }
                        StepOutcome::Settled
                    } else {
                        needs_pacer = session
                            .pacer
                            .as_ref()
                            .map_or(true, |pacer| pacer.is_finished());
                        StepOutcome::MorePending
                    }
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    // Slow consumer: this frame is lost, the session lives on.
                    warn!("Progress session {} buffer full, frame dropped", id);
                    needs_pacer = session
                        .pacer
                        .as_ref()
                        .map_or(true, |pacer| pacer.is_finished());
                    StepOutcome::MorePending
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    drop(sessions);
                    self.unregister(id);
                    return StepOutcome::Settled;
                }
            }
        };

        if needs_pacer {
            self.spawn_pacer(id);
        }
        outcome
    }

    /// Background task delivering the remainder of a clamped jump in paced
    /// steps. Exits as soon as the session settles or disappears.
    fn spawn_pacer(self: &Arc<Self>, id: Uuid) {
        let weak = Arc::downgrade(self);
        let interval = self.pace_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.step(id) == StepOutcome::Settled {
                    break;
                }
            }
        });

        if let Some(session) = self.sessions().get_mut(&id) {
            session.pacer = Some(handle);
        } else {
            // Session vanished between step and here
            handle.abort();
        }
    }
}

/// Owned registry of progress push sessions
#[derive(Clone)]
pub struct ProgressHub {
    inner: Arc<HubInner>,
}

impl Default for ProgressHub {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressHub {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                sessions: Mutex::new(HashMap::new()),
                pace_interval: PACE_INTERVAL,
            }),
        }
    }

    /// Register a new session. The initial `{fraction: 0}` frame is queued
    /// immediately.
    ///
    /// Dropping the returned subscription deregisters the session
    /// synchronously, pacer included.
    pub fn subscribe(&self) -> ProgressSubscription {
        let (tx, rx) = mpsc::channel(FRAME_CHANNEL_CAPACITY);
        let id = Uuid::new_v4();

        // Channel is empty, the initial frame always fits
        let _ = tx.try_send(ProgressFrame::initial());

        let mut sessions = self.inner.sessions();
        sessions.insert(
            id,
            Session {
                tx,
                last_delivered: 0.0,
                pending: None,
                pacer: None,
                last_activity: Instant::now(),
            },
        );
        info!(
            "Progress session {} registered ({} active)",
            id,
            sessions.len()
        );
        drop(sessions);

        ProgressSubscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver a progress report to every registered session.
    ///
    /// Each session is stepped independently over a snapshot of the session
    /// set: a failure or throttle decision on one session never blocks or
    /// corrupts delivery to another.
    pub fn publish(&self, fraction: f64, stage: Option<&str>) {
        let fraction = fraction.clamp(0.0, 1.0);
        let target = PendingTarget {
            fraction,
            stage: stage.map(str::to_string),
            done: fraction >= 1.0,
        };

        let ids: Vec<Uuid> = {
            let mut sessions = self.inner.sessions();
            for session in sessions.values_mut() {
                session.pending = Some(target.clone());
            }
            sessions.keys().copied().collect()
        };

        for id in ids {
            self.inner.step(id);
        }
    }

    /// Current number of registered sessions
    pub fn session_count(&self) -> usize {
        self.inner.sessions().len()
    }

    /// Spawn the sweep that drops sessions with no delivery activity inside
    /// the idle window (abandoned observers must not grow the registry
    /// forever). The task ends when the hub is dropped.
    pub fn start_idle_sweep(&self) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IDLE_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let now = Instant::now();
                let stale: Vec<Uuid> = inner
                    .sessions()
                    .iter()
                    .filter(|(_, s)| now.duration_since(s.last_activity) > IDLE_TIMEOUT)
                    .map(|(id, _)| *id)
                    .collect();
                for id in stale {
                    warn!("Progress session {} idle, dropping", id);
                    inner.unregister(id);
                }
            }
        })
    }
}

/// One observer's handle on its progress stream
pub struct ProgressSubscription {
    id: Uuid,
    rx: mpsc::Receiver<ProgressFrame>,
    hub: Weak<HubInner>,
}

impl ProgressSubscription {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Receive the next frame; `None` once the session is unregistered and
    /// the buffer is drained.
    pub async fn recv(&mut self) -> Option<ProgressFrame> {
        self.rx.recv().await
    }
}

impl Drop for ProgressSubscription {
    fn drop(&mut self) {
        if let Some(inner) = self.hub.upgrade() {
            inner.unregister(self.id);
        }
    }
}
