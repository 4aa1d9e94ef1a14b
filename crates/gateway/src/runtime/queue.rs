//! Lane-based run queue.
//!
//! Generalizes [`super::session_lock::SessionLockMap`]'s per-session
//! `Semaphore(1)` into named lanes with independent concurrency limits:
//!
//! - `session:<key>` — concurrency 1, one lane per session, created lazily.
//! - `subagent` — concurrency 8, shared across all sub-agent runs.
//! - `heartbeat` — concurrency 1, shared across scheduled/heartbeat runs.
//!
//! Each lane is a fully independent [`tokio::sync::Semaphore`]: a busy
//! session lane never blocks the subagent or heartbeat lane, and tokio's
//! semaphore hands out permits to waiters in FIFO order, which gives
//! within-lane ordering without a separate dispatcher loop.
//!
//! Enqueue is idempotent by `runId` — re-enqueuing a run that already
//! holds (or is waiting for) a permit in its lane returns the existing
//! admission instead of double-counting queue depth.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

/// Shared lane name for sub-agent runs.
pub const SUBAGENT_LANE: &str = "subagent";
/// Shared lane name for heartbeat / scheduled runs.
pub const HEARTBEAT_LANE: &str = "heartbeat";

const SUBAGENT_CONCURRENCY: usize = 8;
const HEARTBEAT_CONCURRENCY: usize = 1;
const SESSION_CONCURRENCY: usize = 1;

/// Maximum number of entries (running + waiting) a single lane will admit
/// before rejecting new enqueues with [`QueueFull`].
const DEFAULT_LANE_DEPTH: usize = 64;

/// Returns the lane name for a session-scoped run.
pub fn session_lane(session_key: &str) -> String {
    format!("session:{session_key}")
}

struct LaneState {
    semaphore: Arc<Semaphore>,
    max_depth: usize,
    /// Run ids currently admitted (holding or waiting for a permit) in
    /// this lane, used to make `enqueue` idempotent by `runId`. Shared via
    /// `Arc` so a [`LanePermit`] can remove itself on drop without holding
    /// a reference to the whole lane.
    inflight: Arc<Mutex<HashSet<Uuid>>>,
}

impl LaneState {
    fn new(concurrency: usize, max_depth: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency)),
            max_depth,
            inflight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn depth(&self) -> usize {
        self.inflight.lock().len()
    }

    fn inflight_handle(&self) -> Arc<Mutex<HashSet<Uuid>>> {
        self.inflight.clone()
    }
}

/// A held lane permit. Dropping it releases the lane slot for the next
/// waiter and removes the run id from the lane's inflight set.
pub struct LanePermit {
    _permit: OwnedSemaphorePermit,
    lane: String,
    run_id: Uuid,
    inflight: Arc<Mutex<HashSet<Uuid>>>,
}

impl Drop for LanePermit {
    fn drop(&mut self) {
        self.inflight.lock().remove(&self.run_id);
        tracing::debug!(lane = %self.lane, run_id = %self.run_id, "queue.lane.release");
    }
}

/// A lane is at capacity (running + waiting entries == `max_depth`).
#[derive(Debug)]
pub struct QueueFull {
    pub lane: String,
    pub depth: usize,
}

impl std::fmt::Display for QueueFull {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lane '{}' is full (depth {})", self.lane, self.depth)
    }
}

impl std::error::Error for QueueFull {}

/// Outcome of an `enqueue` call.
pub enum Admission {
    /// A new permit was granted (after an optional wait).
    Granted(LanePermit),
    /// This `runId` was already inflight in this lane; no new permit was
    /// allocated. Callers should treat this as "already scheduled."
    AlreadyInflight,
}

/// Lane-based FIFO run queue with idempotent-by-`runId` enqueue,
/// per-lane backpressure, and independent lane concurrency.
pub struct LaneQueue {
    lanes: Mutex<HashMap<String, Arc<LaneState>>>,
}

impl Default for LaneQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl LaneQueue {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
        }
    }

    fn concurrency_for(lane: &str) -> usize {
        match lane {
            SUBAGENT_LANE => SUBAGENT_CONCURRENCY,
            HEARTBEAT_LANE => HEARTBEAT_CONCURRENCY,
            _ => SESSION_CONCURRENCY,
        }
    }

    fn lane_state(&self, lane: &str) -> Arc<LaneState> {
        let mut lanes = self.lanes.lock();
        lanes
            .entry(lane.to_owned())
            .or_insert_with(|| {
                Arc::new(LaneState::new(Self::concurrency_for(lane), DEFAULT_LANE_DEPTH))
            })
            .clone()
    }

    /// Current depth (running + waiting) of a lane, for observability.
    pub fn depth(&self, lane: &str) -> usize {
        self.lanes
            .lock()
            .get(lane)
            .map(|s| s.depth())
            .unwrap_or(0)
    }

    /// Enqueue `run_id` onto `lane`, waiting for a permit if the lane is
    /// at its concurrency limit. Returns [`QueueFull`] if the lane already
    /// has `max_depth` entries (running or waiting) and `run_id` is not
    /// already among them.
    pub async fn enqueue(&self, lane: &str, run_id: Uuid) -> Result<Admission, QueueFull> {
        let state = self.lane_state(lane);

        {
            let mut inflight = state.inflight.lock();
            if inflight.contains(&run_id) {
                return Ok(Admission::AlreadyInflight);
            }
            if inflight.len() >= state.max_depth {
                return Err(QueueFull {
                    lane: lane.to_owned(),
                    depth: inflight.len(),
                });
            }
            inflight.insert(run_id);
        }

        let enqueued_at = std::time::Instant::now();
        let sem = state.semaphore.clone();

        let permit = match sem.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => match sem.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    // Semaphore closed (shutdown). Undo the inflight mark.
                    state.inflight.lock().remove(&run_id);
                    return Err(QueueFull {
                        lane: lane.to_owned(),
                        depth: state.depth(),
                    });
                }
            },
        };

        let wait_ms = enqueued_at.elapsed().as_millis() as u64;
        tracing::debug!(
            lane = %lane,
            run_id = %run_id,
            wait_ms,
            depth = state.depth(),
            "queue.lane.dequeue"
        );

        Ok(Admission::Granted(LanePermit {
            _permit: permit,
            lane: lane.to_owned(),
            run_id,
            inflight: state.inflight_handle(),
        }))
    }

    /// Remove lanes with no inflight entries (periodic cleanup, mirrors
    /// [`super::session_lock::SessionLockMap::prune_idle`]).
    pub fn prune_idle(&self) {
        let mut lanes = self.lanes.lock();
        lanes.retain(|lane, state| {
            lane == SUBAGENT_LANE || lane == HEARTBEAT_LANE || state.depth() > 0
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_serialize() {
        let queue = Arc::new(LaneQueue::new());
        let lane = session_lane("s1");

        let run1 = Uuid::new_v4();
        let p1 = match queue.enqueue(&lane, run1).await.unwrap() {
            Admission::Granted(p) => p,
            Admission::AlreadyInflight => panic!("unexpected"),
        };
        assert_eq!(queue.depth(&lane), 1);

        let queue2 = queue.clone();
        let lane2 = lane.clone();
        let handle = tokio::spawn(async move {
            let run2 = Uuid::new_v4();
            let _p2 = match queue2.enqueue(&lane2, run2).await.unwrap() {
                Admission::Granted(p) => p,
                Admission::AlreadyInflight => panic!("unexpected"),
            };
            99
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        drop(p1);
        assert_eq!(handle.await.unwrap(), 99);
    }

    #[tokio::test]
    async fn subagent_lane_allows_concurrency() {
        let queue = LaneQueue::new();
        let mut permits = Vec::new();
        for _ in 0..SUBAGENT_CONCURRENCY {
            match queue.enqueue(SUBAGENT_LANE, Uuid::new_v4()).await.unwrap() {
                Admission::Granted(p) => permits.push(p),
                Admission::AlreadyInflight => panic!("unexpected"),
            }
        }
        assert_eq!(queue.depth(SUBAGENT_LANE), SUBAGENT_CONCURRENCY);
    }

    #[tokio::test]
    async fn duplicate_run_id_is_idempotent() {
        let queue = LaneQueue::new();
        let run_id = Uuid::new_v4();
        let lane = session_lane("s1");

        let _p1 = match queue.enqueue(&lane, run_id).await.unwrap() {
            Admission::Granted(p) => p,
            Admission::AlreadyInflight => panic!("unexpected"),
        };

        match queue.enqueue(&lane, run_id).await.unwrap() {
            Admission::AlreadyInflight => {}
            Admission::Granted(_) => panic!("duplicate runId should not grant a second permit"),
        }
    }

    #[tokio::test]
    async fn full_lane_rejects() {
        let queue = LaneQueue::new();
        let lane = "session:s1".to_string();
        let lane_state = queue.lane_state(&lane);
        // Artificially shrink the depth limit via a tiny scenario: fill
        // inflight directly to exercise the QueueFull path.
        for _ in 0..DEFAULT_LANE_DEPTH {
            lane_state.inflight.lock().insert(Uuid::new_v4());
        }
        let err = queue.enqueue(&lane, Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.lane, lane);
    }
}
