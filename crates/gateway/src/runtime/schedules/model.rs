//! Schedule data model — types, enums, and config structs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Cron behaviour enums & config types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What happens when the runner discovers a missed window.
///
/// Only meaningful for [`ScheduleKind::Cron`] — `At`/`Every` jobs have no
/// concept of a "missed window", they just fire whenever they next come due.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MissedPolicy {
    /// Drop the missed run silently.
    Skip,
    /// Fire exactly once, no matter how many windows were missed.
    RunOnce,
    /// Fire once for every missed window (with back-off cap).
    CatchUp,
}

impl Default for MissedPolicy {
    fn default() -> Self {
        Self::RunOnce
    }
}

/// How to compile multi-source content into a single digest.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DigestMode {
    /// Include full content from every source every time.
    Full,
    /// Only include sources whose content changed since last run.
    ChangesOnly,
}

impl Default for DigestMode {
    fn default() -> Self {
        Self::Full
    }
}

/// Per-schedule HTTP fetch configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Timeout per HTTP request in milliseconds.
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
    /// User-Agent header sent when fetching sources.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Maximum response body size in bytes (0 = unlimited).
    #[serde(default)]
    pub max_size_bytes: u64,
}

fn default_fetch_timeout_ms() -> u64 {
    30_000
}

fn default_user_agent() -> String {
    "OpenClaw Gateway/1.0".to_string()
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_fetch_timeout_ms(),
            user_agent: default_user_agent(),
            max_size_bytes: 0,
        }
    }
}

/// Per-source state tracking for change detection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceState {
    /// When this source was last fetched successfully.
    pub last_fetched_at: Option<DateTime<Utc>>,
    /// SHA-256 hash of the last successfully fetched content.
    pub last_content_hash: Option<String>,
    /// HTTP status code of last fetch attempt.
    pub last_http_status: Option<u16>,
    /// Error message if last fetch failed.
    pub last_error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// CronJob shape — when to fire, who to target, what to do
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// When a job fires.
///
/// `Cron` wraps the timezone-aware 5-field evaluator in [`super::cron`].
/// `At`/`Every` are plain millisecond arithmetic and never consult a cron
/// expression at all.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleKind {
    /// Fire once at an absolute instant, then auto-disable.
    At { at_ms: i64 },
    /// Fire every `every_ms`, anchored at `anchor_ms`.
    Every { every_ms: i64, anchor_ms: i64 },
    /// Fire on a 5-field cron expression in the given IANA timezone.
    Cron { expr: String, tz: String },
}

impl Default for ScheduleKind {
    fn default() -> Self {
        Self::Cron {
            expr: "0 * * * *".to_string(),
            tz: "UTC".to_string(),
        }
    }
}

/// Where a fired job's effect lands.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionTarget {
    /// No session involved — `payload` is delivered directly (channel send).
    Direct,
    /// The agent's persistent main session (`agent:<id>:main`).
    Agent,
    /// A session dedicated to this schedule (`schedule:<id>`).
    Session,
}

impl Default for SessionTarget {
    fn default() -> Self {
        Self::Session
    }
}

/// Whether a system event should wake its target immediately or wait for
/// the next heartbeat tick.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WakeMode {
    Now,
    NextHeartbeat,
}

impl Default for WakeMode {
    fn default() -> Self {
        Self::Now
    }
}

/// What happens when a job comes due.
///
/// `SystemEvent` replaces the teacher's standalone `prompt_template` field —
/// its `text` plays the same role (a templated prompt, substituted by
/// [`super::super::digest::build_digest_prompt`] when `sources` are
/// configured). `Message` bypasses the agent entirely.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchedulePayload {
    /// Push a transient system event into the target's heartbeat queue (or
    /// run it immediately, depending on `wake_mode`).
    SystemEvent { text: String },
    /// Call the channel adapter's `send` directly. No agent run is created.
    Message {
        text: String,
        channel: String,
        #[serde(default)]
        to: Option<String>,
    },
}

impl Default for SchedulePayload {
    fn default() -> Self {
        Self::SystemEvent {
            text: String::new(),
        }
    }
}

impl SchedulePayload {
    /// `true` for `Message` — the only payload kind that requires
    /// `session_target = Direct` (see [`Schedule::new`]'s invariant check).
    pub fn is_message(&self) -> bool {
        matches!(self, Self::Message { .. })
    }
}

/// Error returned when `payload`/`session_target` violate the
/// `payload.kind = message ⟺ session_target = direct` invariant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMismatch;

impl std::fmt::Display for TargetMismatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "payload.kind=message requires session_target=direct (and vice versa)"
        )
    }
}

impl std::error::Error for TargetMismatch {}

/// Compute the next firing instant after `after`, given a schedule kind.
/// `At` jobs have no "next" past their one instant; `Every` jobs snap
/// forward from `anchor_ms` in `every_ms` steps (the teacher's exact
/// `nextRunAtMs = previous + everyMs` rescheduling logic, generalized to
/// start from an arbitrary anchor instead of only the last run).
pub fn next_occurrence(kind: &ScheduleKind, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match kind {
        ScheduleKind::At { at_ms } => {
            let at = DateTime::<Utc>::from_timestamp_millis(*at_ms)?;
            (at > after).then_some(at)
        }
        ScheduleKind::Every {
            every_ms,
            anchor_ms,
        } => {
            if *every_ms <= 0 {
                return None;
            }
            let anchor = DateTime::<Utc>::from_timestamp_millis(*anchor_ms)?;
            let step = chrono::Duration::milliseconds(*every_ms);
            let mut next = anchor;
            // Anchor may be in the past (or the future); walk forward until
            // strictly after `after`.
            while next <= after {
                next += step;
            }
            Some(next)
        }
        ScheduleKind::Cron { expr, tz } => {
            super::cron::cron_next_tz(expr, &after, super::cron::parse_tz(tz))
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_max_concurrency() -> u32 {
    1
}

fn default_max_catchup_runs() -> usize {
    5
}

const MAX_COOLDOWN_MINUTES: u64 = 24 * 60; // 24 hours

/// Compute cooldown duration in minutes: 2^(failures - 1), capped at 24h.
pub fn cooldown_minutes(consecutive_failures: u32) -> u64 {
    if consecutive_failures == 0 {
        return 0;
    }
    let exp = (consecutive_failures - 1).min(20); // prevent overflow
    let minutes = 1u64.checked_shl(exp).unwrap_or(MAX_COOLDOWN_MINUTES);
    minutes.min(MAX_COOLDOWN_MINUTES)
}

/// Persisted schedule. `status` is NOT stored — it is derived from
/// `enabled` + `consecutive_failures` via [`Schedule::computed_status`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    /// When this job fires.
    #[serde(default)]
    pub schedule: ScheduleKind,
    /// Where the fired job's effect lands.
    #[serde(default)]
    pub session_target: SessionTarget,
    /// Immediate wake vs. wait for the next heartbeat tick.
    #[serde(default)]
    pub wake_mode: WakeMode,
    /// What to do when the job fires.
    #[serde(default)]
    pub payload: SchedulePayload,
    pub enabled: bool,
    pub agent_id: String,
    /// URLs or data sources digested into the prompt (SystemEvent jobs only).
    pub sources: Vec<String>,
    pub delivery_targets: Vec<DeliveryTarget>,
    /// HMAC-SHA256 secret for the `/v1/schedules/:id/trigger` webhook, if set.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_run_id: Option<Uuid>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    // ── Cron behaviour ────────────────────────────────────────────────
    /// What to do when a cron window is missed (default: run_once).
    #[serde(default)]
    pub missed_policy: MissedPolicy,
    /// Max concurrent runs for this schedule (default: 1).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    /// Per-run timeout in milliseconds (None = no timeout).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// How to compile multi-source content (default: full).
    #[serde(default)]
    pub digest_mode: DigestMode,

    // ── Fetch configuration ─────────────────────────────────────────
    /// HTTP fetch settings applied to all sources.
    #[serde(default)]
    pub fetch_config: FetchConfig,
    /// Per-source change-detection state (keyed by source URL).
    #[serde(default)]
    pub source_states: HashMap<String, SourceState>,

    // ── Catch-up configuration ─────────────────────────────────────
    /// Maximum catch-up runs per tick when using CatchUp missed policy.
    #[serde(default = "default_max_catchup_runs")]
    pub max_catchup_runs: usize,

    // ── Error tracking (replaces the old persisted `status` field) ────
    /// Most recent error message from a failed run.
    #[serde(default)]
    pub last_error: Option<String>,
    /// When the most recent error occurred.
    #[serde(default)]
    pub last_error_at: Option<DateTime<Utc>>,
    /// Number of consecutive failed runs (resets on success).
    #[serde(default)]
    pub consecutive_failures: u32,
    /// Schedule is in cooldown until this time (exponential back-off).
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,

    // ── Usage tracking ───────────────────────────────────────────────
    /// Cumulative input tokens across all runs.
    #[serde(default)]
    pub total_input_tokens: u64,
    /// Cumulative output tokens across all runs.
    #[serde(default)]
    pub total_output_tokens: u64,
    /// Total number of completed runs.
    #[serde(default)]
    pub total_runs: u64,
}

impl Schedule {
    /// Validate the `payload.kind = message ⟺ session_target = direct`
    /// invariant. Construct `Schedule` values through this rather than the
    /// struct literal directly wherever the kind/target pair is caller-chosen.
    pub fn check_target_invariant(
        payload: &SchedulePayload,
        session_target: SessionTarget,
    ) -> Result<(), TargetMismatch> {
        if payload.is_message() == (session_target == SessionTarget::Direct) {
            Ok(())
        } else {
            Err(TargetMismatch)
        }
    }

    /// Derive status from persisted state. Never stored.
    pub fn computed_status(&self) -> ScheduleStatus {
        if !self.enabled {
            ScheduleStatus::Paused
        } else if self.consecutive_failures > 0 {
            ScheduleStatus::Error
        } else {
            ScheduleStatus::Active
        }
    }

    /// Build an API-facing view with computed `status`.
    pub fn to_view(&self) -> ScheduleView {
        ScheduleView {
            schedule: self.clone(),
            status: self.computed_status(),
        }
    }

    /// The IANA timezone governing this schedule, for display/templating.
    /// `At`/`Every` jobs have no timezone of their own; they report UTC.
    pub fn timezone_str(&self) -> &str {
        match &self.schedule {
            ScheduleKind::Cron { tz, .. } => tz,
            _ => "UTC",
        }
    }

    /// The templated prompt text for `SystemEvent` payloads. Empty for
    /// `Message` payloads, which carry their own un-templated `text`.
    pub fn prompt_text(&self) -> &str {
        match &self.payload {
            SchedulePayload::SystemEvent { text } => text,
            SchedulePayload::Message { .. } => "",
        }
    }

    /// Session key the fired job's effect is attributed to. `None` for
    /// `SessionTarget::Direct` (no session is involved).
    pub fn target_session_key(&self) -> Option<String> {
        match self.session_target {
            SessionTarget::Direct => None,
            SessionTarget::Agent => Some(format!("agent:{}:main", self.agent_id)),
            SessionTarget::Session => Some(format!("schedule:{}", self.id)),
        }
    }

    /// Advance `next_run_at` after a run fires, applying `At`'s
    /// auto-disable-after-one-shot rule. `last_run_at` must already be set
    /// to `now` by the caller before this runs.
    pub fn reschedule_after_run(&mut self, now: DateTime<Utc>) {
        match &self.schedule {
            ScheduleKind::At { .. } => {
                self.enabled = false;
                self.next_run_at = None;
            }
            _ => {
                self.next_run_at = next_occurrence(&self.schedule, now);
            }
        }
    }
}

/// API response wrapper that includes the computed `status` field.
#[derive(Clone, Debug, Serialize)]
pub struct ScheduleView {
    #[serde(flatten)]
    pub schedule: Schedule,
    pub status: ScheduleStatus,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStatus {
    Active,
    Paused,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryTarget {
    InApp,
    Webhook { url: String },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule events (for SSE)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleEvent {
    ScheduleUpdated { schedule: ScheduleView },
    ScheduleRunStarted { schedule_id: Uuid, run_id: Uuid },
    ScheduleRunCompleted { schedule_id: Uuid, run_id: Uuid },
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Helper to build a minimal Schedule for testing computed_status.
    fn test_schedule(enabled: bool, consecutive_failures: u32) -> Schedule {
        Schedule {
            id: Uuid::new_v4(),
            name: "test".into(),
            schedule: ScheduleKind::Cron {
                expr: "0 * * * *".into(),
                tz: "UTC".into(),
            },
            session_target: SessionTarget::Session,
            wake_mode: WakeMode::Now,
            payload: SchedulePayload::SystemEvent {
                text: String::new(),
            },
            enabled,
            agent_id: String::new(),
            sources: vec![],
            delivery_targets: vec![],
            webhook_secret: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            last_run_id: None,
            last_run_at: None,
            next_run_at: None,
            missed_policy: MissedPolicy::default(),
            max_concurrency: 1,
            timeout_ms: None,
            digest_mode: DigestMode::default(),
            fetch_config: FetchConfig::default(),
            max_catchup_runs: 5,
            source_states: HashMap::new(),
            last_error: if consecutive_failures > 0 {
                Some("test error".into())
            } else {
                None
            },
            last_error_at: None,
            consecutive_failures,
            cooldown_until: None,
            total_input_tokens: 0,
            total_output_tokens: 0,
            total_runs: 0,
        }
    }

    #[test]
    fn computed_status_active() {
        let s = test_schedule(true, 0);
        assert_eq!(s.computed_status(), ScheduleStatus::Active);
    }

    #[test]
    fn computed_status_paused() {
        let s = test_schedule(false, 0);
        assert_eq!(s.computed_status(), ScheduleStatus::Paused);
    }

    #[test]
    fn computed_status_error() {
        let s = test_schedule(true, 3);
        assert_eq!(s.computed_status(), ScheduleStatus::Error);
    }

    #[test]
    fn computed_status_paused_trumps_error() {
        let s = test_schedule(false, 5);
        assert_eq!(s.computed_status(), ScheduleStatus::Paused);
    }

    #[test]
    fn to_view_includes_computed_status() {
        let s = test_schedule(true, 0);
        let view = s.to_view();
        assert_eq!(view.status, ScheduleStatus::Active);

        let s2 = test_schedule(true, 1);
        let view2 = s2.to_view();
        assert_eq!(view2.status, ScheduleStatus::Error);
    }

    #[test]
    fn schedule_deserializes_with_defaults_only() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "legacy",
            "enabled": true,
            "agent_id": "",
            "sources": [],
            "delivery_targets": [],
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        });
        let s: Schedule = serde_json::from_value(json).unwrap();
        assert_eq!(s.consecutive_failures, 0);
        assert!(s.last_error.is_none());
        assert_eq!(s.computed_status(), ScheduleStatus::Active);
        assert_eq!(s.missed_policy, MissedPolicy::RunOnce);
        assert_eq!(s.max_concurrency, 1);
        assert!(s.timeout_ms.is_none());
        assert_eq!(s.digest_mode, DigestMode::Full);
        assert_eq!(s.fetch_config.timeout_ms, 30_000);
        assert!(s.source_states.is_empty());
        assert_eq!(s.schedule, ScheduleKind::default());
        assert_eq!(s.session_target, SessionTarget::Session);
        assert_eq!(s.wake_mode, WakeMode::Now);
        assert!(s.webhook_secret.is_none());
    }

    #[test]
    fn missed_policy_serde_roundtrip() {
        let policies = [MissedPolicy::Skip, MissedPolicy::RunOnce, MissedPolicy::CatchUp];
        for p in &policies {
            let json = serde_json::to_string(p).unwrap();
            let back: MissedPolicy = serde_json::from_str(&json).unwrap();
            assert_eq!(*p, back);
        }
    }

    #[test]
    fn digest_mode_serde_roundtrip() {
        let modes = [DigestMode::Full, DigestMode::ChangesOnly];
        for m in &modes {
            let json = serde_json::to_string(m).unwrap();
            let back: DigestMode = serde_json::from_str(&json).unwrap();
            assert_eq!(*m, back);
        }
    }

    #[test]
    fn fetch_config_defaults() {
        let fc = FetchConfig::default();
        assert_eq!(fc.timeout_ms, 30_000);
        assert_eq!(fc.user_agent, "OpenClaw Gateway/1.0");
        assert_eq!(fc.max_size_bytes, 0);
    }

    #[test]
    fn schedule_with_phase2_fields_roundtrips() {
        let mut s = test_schedule(true, 0);
        s.missed_policy = MissedPolicy::CatchUp;
        s.max_concurrency = 3;
        s.timeout_ms = Some(60_000);
        s.digest_mode = DigestMode::ChangesOnly;
        s.fetch_config.user_agent = "Custom/2.0".into();
        s.source_states.insert("https://example.com".into(), SourceState {
            last_fetched_at: Some(Utc::now()),
            last_content_hash: Some("abc123".into()),
            last_http_status: Some(200),
            last_error: None,
        });
        let json = serde_json::to_string(&s).unwrap();
        let back: Schedule = serde_json::from_str(&json).unwrap();
        assert_eq!(back.missed_policy, MissedPolicy::CatchUp);
        assert_eq!(back.max_concurrency, 3);
        assert_eq!(back.timeout_ms, Some(60_000));
        assert_eq!(back.digest_mode, DigestMode::ChangesOnly);
        assert_eq!(back.fetch_config.user_agent, "Custom/2.0");
        assert!(back.source_states.contains_key("https://example.com"));
    }

    #[test]
    fn cooldown_minutes_zero_failures() {
        assert_eq!(cooldown_minutes(0), 0);
    }

    #[test]
    fn cooldown_minutes_exponential() {
        assert_eq!(cooldown_minutes(1), 1);
        assert_eq!(cooldown_minutes(2), 2);
        assert_eq!(cooldown_minutes(3), 4);
        assert_eq!(cooldown_minutes(4), 8);
        assert_eq!(cooldown_minutes(5), 16);
    }

    #[test]
    fn cooldown_minutes_capped_at_24h() {
        assert_eq!(cooldown_minutes(21), 24 * 60);
        assert_eq!(cooldown_minutes(50), 24 * 60);
    }

    #[test]
    fn schedule_backward_compat_no_cooldown_field() {
        let json = serde_json::json!({
            "id": Uuid::new_v4(),
            "name": "legacy",
            "enabled": true,
            "agent_id": "",
            "sources": [],
            "delivery_targets": [],
            "created_at": "2024-01-01T00:00:00Z",
            "updated_at": "2024-01-01T00:00:00Z",
        });
        let s: Schedule = serde_json::from_value(json).unwrap();
        assert!(s.cooldown_until.is_none());
        assert_eq!(s.max_catchup_runs, 5);
    }

    // ── CronJob shape ──────────────────────────────────────────────────

    #[test]
    fn target_invariant_rejects_message_without_direct() {
        let payload = SchedulePayload::Message {
            text: "hi".into(),
            channel: "telegram".into(),
            to: Some("123".into()),
        };
        assert!(Schedule::check_target_invariant(&payload, SessionTarget::Agent).is_err());
        assert!(Schedule::check_target_invariant(&payload, SessionTarget::Direct).is_ok());
    }

    #[test]
    fn target_invariant_rejects_direct_without_message() {
        let payload = SchedulePayload::SystemEvent {
            text: "hi".into(),
        };
        assert!(Schedule::check_target_invariant(&payload, SessionTarget::Direct).is_err());
        assert!(Schedule::check_target_invariant(&payload, SessionTarget::Session).is_ok());
        assert!(Schedule::check_target_invariant(&payload, SessionTarget::Agent).is_ok());
    }

    #[test]
    fn next_occurrence_at_fires_once_then_none() {
        let now = Utc::now();
        let at_ms = (now + chrono::Duration::seconds(5)).timestamp_millis();
        let kind = ScheduleKind::At { at_ms };
        assert!(next_occurrence(&kind, now).is_some());
        let past = ScheduleKind::At {
            at_ms: (now - chrono::Duration::seconds(5)).timestamp_millis(),
        };
        assert!(next_occurrence(&past, now).is_none());
    }

    #[test]
    fn next_occurrence_every_steps_forward_from_anchor() {
        use chrono::TimeZone;
        let anchor = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let kind = ScheduleKind::Every {
            every_ms: 3_600_000,
            anchor_ms: anchor.timestamp_millis(),
        };
        let after = anchor + chrono::Duration::minutes(90);
        let next = next_occurrence(&kind, after).unwrap();
        assert_eq!(next, anchor + chrono::Duration::hours(2));
    }

    #[test]
    fn next_occurrence_every_rejects_nonpositive_interval() {
        let kind = ScheduleKind::Every {
            every_ms: 0,
            anchor_ms: 0,
        };
        assert!(next_occurrence(&kind, Utc::now()).is_none());
    }

    #[test]
    fn next_occurrence_cron_matches_existing_evaluator() {
        use chrono::TimeZone;
        let after = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let kind = ScheduleKind::Cron {
            expr: "30 * * * *".into(),
            tz: "UTC".into(),
        };
        let next = next_occurrence(&kind, after).unwrap();
        assert_eq!(next, super::super::cron::cron_next("30 * * * *", &after).unwrap());
    }

    #[test]
    fn reschedule_after_run_disables_at_jobs() {
        let mut s = test_schedule(true, 0);
        s.schedule = ScheduleKind::At {
            at_ms: Utc::now().timestamp_millis(),
        };
        s.reschedule_after_run(Utc::now());
        assert!(!s.enabled);
        assert!(s.next_run_at.is_none());
    }

    #[test]
    fn reschedule_after_run_keeps_every_jobs_enabled() {
        let mut s = test_schedule(true, 0);
        let anchor = Utc::now();
        s.schedule = ScheduleKind::Every {
            every_ms: 60_000,
            anchor_ms: anchor.timestamp_millis(),
        };
        s.reschedule_after_run(anchor);
        assert!(s.enabled);
        assert!(s.next_run_at.is_some());
    }

    #[test]
    fn target_session_key_variants() {
        let mut s = test_schedule(true, 0);
        s.agent_id = "main".into();
        s.session_target = SessionTarget::Agent;
        assert_eq!(s.target_session_key().as_deref(), Some("agent:main:main"));
        s.session_target = SessionTarget::Session;
        assert_eq!(s.target_session_key(), Some(format!("schedule:{}", s.id)));
        s.session_target = SessionTarget::Direct;
        assert_eq!(s.target_session_key(), None);
    }

    #[test]
    fn prompt_text_empty_for_message_payload() {
        let mut s = test_schedule(true, 0);
        s.payload = SchedulePayload::Message {
            text: "reminder".into(),
            channel: "telegram".into(),
            to: None,
        };
        assert_eq!(s.prompt_text(), "");
    }
}
