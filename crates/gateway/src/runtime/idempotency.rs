//! `chat.send` idempotency cache.
//!
//! Grounded on [`crate::api::inbound::DedupeStore`]'s shape (a
//! `parking_lot::Mutex<HashMap<..>>` with a TTL and lazy cleanup), but a
//! distinct instance with a distinct key space and a shorter default TTL:
//! `DedupeStore` dedupes inbound *events* for 24h, this dedupes `chat.send`
//! *requests* by caller-supplied `idempotencyKey` for 10 minutes, and
//! additionally tracks in-flight (not-yet-terminal) runs so a retry that
//! races a still-running turn doesn't start a second one.
//!
//! Keys are stored as given by callers; `chat:<idempotencyKey>` prefixing
//! (per the wire contract) is the caller's responsibility.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

const DEFAULT_TTL: Duration = Duration::from_secs(600);

enum Entry {
    /// A run for this key is currently executing.
    InFlight { run_id: Uuid, started_at: Instant },
    /// A run for this key finished; the payload is cached for replay.
    Completed {
        payload: serde_json::Value,
        completed_at: Instant,
    },
}

/// Result of attempting to begin a `chat.send` for a given idempotency key.
pub enum ChatSendOutcome {
    /// No prior attempt (or the prior attempt's cache entry expired).
    /// The caller should start a new run under `run_id` and later call
    /// [`ChatIdempotencyCache::complete`].
    Start { run_id: Uuid },
    /// A run for this key is still executing. Callers return
    /// `{status: "in_flight"}` without starting a new run.
    InFlight { run_id: Uuid },
    /// A prior run for this key already completed within the TTL. Callers
    /// return the cached payload with `cached: true`.
    Cached { payload: serde_json::Value },
}

/// TTL-bounded cache mapping `chat.send` idempotency keys to run outcomes.
pub struct ChatIdempotencyCache {
    entries: Mutex<HashMap<String, Entry>>,
    ttl: Duration,
}

impl Default for ChatIdempotencyCache {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl ChatIdempotencyCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Begin (or rejoin) a `chat.send` attempt for `idempotency_key`.
    pub fn begin(&self, idempotency_key: &str) -> ChatSendOutcome {
        let mut entries = self.entries.lock();
        let now = Instant::now();

        if entries.len() > 10_000 {
            entries.retain(|_, e| match e {
                Entry::Completed { completed_at, .. } => now.duration_since(*completed_at) < self.ttl,
                Entry::InFlight { .. } => true,
            });
        }

        match entries.get(idempotency_key) {
            Some(Entry::InFlight { run_id, .. }) => {
                return ChatSendOutcome::InFlight { run_id: *run_id };
            }
            Some(Entry::Completed {
                payload,
                completed_at,
            }) if now.duration_since(*completed_at) < self.ttl => {
                return ChatSendOutcome::Cached {
                    payload: payload.clone(),
                };
            }
            _ => {}
        }

        let run_id = Uuid::new_v4();
        entries.insert(
            idempotency_key.to_string(),
            Entry::InFlight {
                run_id,
                started_at: now,
            },
        );
        ChatSendOutcome::Start { run_id }
    }

    /// Record the terminal payload for a key, replacing its in-flight entry.
    pub fn complete(&self, idempotency_key: &str, payload: serde_json::Value) {
        let mut entries = self.entries.lock();
        entries.insert(
            idempotency_key.to_string(),
            Entry::Completed {
                payload,
                completed_at: Instant::now(),
            },
        );
    }

    /// Drop the in-flight marker without caching a payload (e.g. the run
    /// failed to even start). A subsequent `begin` starts fresh.
    pub fn abandon(&self, idempotency_key: &str) {
        self.entries.lock().remove(idempotency_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn first_attempt_starts() {
        let cache = ChatIdempotencyCache::new(Duration::from_secs(600));
        match cache.begin("k1") {
            ChatSendOutcome::Start { .. } => {}
            _ => panic!("expected Start"),
        }
    }

    #[test]
    fn concurrent_retry_sees_in_flight() {
        let cache = ChatIdempotencyCache::new(Duration::from_secs(600));
        let run_id = match cache.begin("k1") {
            ChatSendOutcome::Start { run_id } => run_id,
            _ => panic!("expected Start"),
        };
        match cache.begin("k1") {
            ChatSendOutcome::InFlight { run_id: seen } => assert_eq!(seen, run_id),
            _ => panic!("expected InFlight"),
        }
    }

    #[test]
    fn completed_replay_returns_cached() {
        let cache = ChatIdempotencyCache::new(Duration::from_secs(600));
        match cache.begin("k1") {
            ChatSendOutcome::Start { .. } => {}
            _ => panic!("expected Start"),
        }
        cache.complete("k1", json!({"runId": "abc", "status": "final"}));
        match cache.begin("k1") {
            ChatSendOutcome::Cached { payload } => {
                assert_eq!(payload["status"], "final");
            }
            _ => panic!("expected Cached"),
        }
    }

    #[test]
    fn expired_entry_starts_fresh() {
        let cache = ChatIdempotencyCache::new(Duration::from_millis(10));
        match cache.begin("k1") {
            ChatSendOutcome::Start { .. } => {}
            _ => panic!("expected Start"),
        }
        cache.complete("k1", json!({"status": "final"}));
        std::thread::sleep(Duration::from_millis(20));
        match cache.begin("k1") {
            ChatSendOutcome::Start { .. } => {}
            _ => panic!("expected fresh Start after expiry"),
        }
    }
}
