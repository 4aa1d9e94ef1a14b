//! Exec approval workflow — gates dangerous commands behind human approval.
//!
//! A command that misses the configured `ExecPolicy` allowlist (or whose
//! policy demands it regardless) is paused as a `PendingApproval` until a
//! human resolves it — via the REST API, a future RPC Hub call, or a
//! chat-channel `/approve` command — or until `timeout` elapses. `allowAlways`
//! decisions are persisted to disk so the same command skips the prompt on
//! every later run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use uuid::Uuid;

use gw_domain::config::{ExecAskMode, ExecHost, ExecPolicy, ExecSecurityLevel};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The decision made by a human reviewer (or `/approve <id> <outcome>`).
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    /// Run this one call; does not touch the persisted allowlist.
    AllowOnce,
    /// Run this call and persist the command so future calls skip the ask.
    AllowAlways,
    Denied { reason: Option<String> },
}

/// Resolved state of an approval, mirrors `ApprovalRequest.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    AllowOnce,
    AllowAlways,
    Denied,
    Expired,
}

impl From<&ApprovalDecision> for ApprovalStatus {
    fn from(d: &ApprovalDecision) -> Self {
        match d {
            ApprovalDecision::AllowOnce => ApprovalStatus::AllowOnce,
            ApprovalDecision::AllowAlways => ApprovalStatus::AllowAlways,
            ApprovalDecision::Denied { .. } => ApprovalStatus::Denied,
        }
    }
}

/// A pending approval waiting for human review.
pub struct PendingApproval {
    pub id: Uuid,
    pub run_id: Option<Uuid>,
    pub session_key: String,
    pub agent_id: Option<String>,
    pub command: String,
    pub host: ExecHost,
    pub node_ref: Option<String>,
    pub cwd: Option<String>,
    pub env: Vec<(String, String)>,
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub respond: oneshot::Sender<ApprovalDecision>,
}

/// Serializable snapshot of a pending approval (for API responses / SSE events).
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalInfo {
    pub id: Uuid,
    pub run_id: Option<Uuid>,
    pub session_key: String,
    pub agent_id: Option<String>,
    pub command: String,
    pub host: ExecHost,
    pub node_ref: Option<String>,
    pub cwd: Option<String>,
    pub rationale: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub status: ApprovalStatus,
}

impl From<&PendingApproval> for ApprovalInfo {
    fn from(p: &PendingApproval) -> Self {
        Self {
            id: p.id,
            run_id: p.run_id,
            session_key: p.session_key.clone(),
            agent_id: p.agent_id.clone(),
            command: p.command.clone(),
            host: p.host,
            node_ref: p.node_ref.clone(),
            cwd: p.cwd.clone(),
            rationale: p.rationale.clone(),
            created_at: p.created_at,
            expires_at: p.expires_at,
            status: ApprovalStatus::Pending,
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Thread-safe store for pending exec approvals, plus the persisted
/// `allowAlways` allowlist (`<state_dir>/exec-approvals.json`).
pub struct ApprovalStore {
    pending: RwLock<HashMap<Uuid, PendingApproval>>,
    timeout: Duration,
    persist_path: PathBuf,
    allowed_always: RwLock<Vec<String>>,
}

impl ApprovalStore {
    /// Create a new store with the given approval timeout, loading any
    /// previously persisted `allowAlways` grants from `state_dir`.
    pub fn new(timeout: Duration, state_dir: &std::path::Path) -> Self {
        let persist_path = state_dir.join("exec-approvals.json");
        let allowed_always = Self::load(&persist_path);
        Self {
            pending: RwLock::new(HashMap::new()),
            timeout,
            persist_path,
            allowed_always: RwLock::new(allowed_always),
        }
    }

    fn load(path: &std::path::Path) -> Vec<String> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|data| serde_json::from_str(&data).ok())
            .unwrap_or_default()
    }

    fn persist(&self) {
        let globs = self.allowed_always.read().clone();
        let Ok(json) = serde_json::to_string_pretty(&globs) else {
            return;
        };
        if let Some(parent) = self.persist_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&self.persist_path, json) {
            tracing::warn!(error = %e, "failed to persist exec approval allowlist");
        }
    }

    /// The configured approval timeout duration.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Commands persisted from prior `allowAlways` decisions. The caller
    /// merges these into the configured allowlist before a glob match.
    pub fn persisted_allowlist(&self) -> Vec<String> {
        self.allowed_always.read().clone()
    }

    /// Insert a pending approval. Returns the serializable info snapshot.
    pub fn insert(&self, approval: PendingApproval) -> ApprovalInfo {
        let info = ApprovalInfo::from(&approval);
        self.pending.write().insert(approval.id, approval);
        info
    }

    /// Resolve a pending approval. Returns `true` if a matching entry was
    /// found. `AllowAlways` additionally persists the command.
    pub fn resolve(&self, id: &Uuid, decision: ApprovalDecision) -> bool {
        let Some(pending) = self.pending.write().remove(id) else {
            return false;
        };
        if let ApprovalDecision::AllowAlways = decision {
            self.remember_always(&pending.command);
        }
        let _ = pending.respond.send(decision);
        true
    }

    fn remember_always(&self, command: &str) {
        let mut globs = self.allowed_always.write();
        if globs.iter().any(|g| g == command) {
            return;
        }
        globs.push(command.to_string());
        drop(globs);
        self.persist();
    }

    /// Remove a timed-out approval (called when the receiver times out).
    pub fn remove_expired(&self, id: &Uuid) {
        self.pending.write().remove(id);
    }

    /// List all currently pending approvals (for dashboard introspection).
    pub fn list_pending(&self) -> Vec<ApprovalInfo> {
        self.pending
            .read()
            .values()
            .map(ApprovalInfo::from)
            .collect()
    }

    /// Insert `approval` and block until it is resolved or `timeout` elapses.
    /// A timeout removes the entry and resolves it as `Expired`, same as a
    /// dropped sender (caller shut down without deciding).
    pub async fn await_decision(
        &self,
        approval: PendingApproval,
        rx: oneshot::Receiver<ApprovalDecision>,
    ) -> ApprovalStatus {
        let id = approval.id;
        self.insert(approval);
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(decision)) => ApprovalStatus::from(&decision),
            Ok(Err(_)) | Err(_) => {
                self.remove_expired(&id);
                ApprovalStatus::Expired
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Gating
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Parameters describing the exec call being gated, independent of the
/// `ExecRequest` wire type so this module has no dependency on `gw-tools`.
pub struct ExecCallContext<'a> {
    pub command: &'a str,
    pub session_key: &'a str,
    pub run_id: Option<Uuid>,
    pub agent_id: Option<&'a str>,
    pub cwd: Option<&'a str>,
    pub env: Vec<(String, String)>,
}

/// Outcome of consulting the Exec Approval Engine for one call.
pub enum GateOutcome {
    /// Dispatch the command.
    Proceed,
    /// Do not dispatch; surface this message as a tool error result.
    Denied(String),
}

/// Translate a shell-glob pattern (`*`, `?`) into an anchored, case-insensitive
/// regex. The only metacharacters recognized are glob wildcards; everything
/// else is escaped literally.
fn glob_to_regex(pattern: &str) -> Option<regex::Regex> {
    let mut out = String::from("(?i)^");
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    regex::Regex::new(&out).ok()
}

fn command_matches_any(patterns: &[String], command: &str) -> bool {
    patterns
        .iter()
        .any(|p| glob_to_regex(p).is_some_and(|re| re.is_match(command)))
}

/// First whitespace-delimited token of a shell command — the binary name,
/// used for the `safe_bins` bypass.
fn command_bin(command: &str) -> &str {
    command.trim().split_whitespace().next().unwrap_or("")
}

/// Decide whether `ctx.command` may run under `policy`, consulting
/// `store` (and blocking on human review) when the policy demands it.
///
/// Does not check `denied_patterns` — callers reject those before ever
/// reaching this function, since a hard deny should never cost an approval
/// round-trip.
pub async fn gate(policy: &ExecPolicy, store: &ApprovalStore, ctx: ExecCallContext<'_>) -> GateOutcome {
    if policy.security == ExecSecurityLevel::Deny {
        return GateOutcome::Denied("exec denied by policy (security=deny)".into());
    }

    let safe_bin = policy.safe_bins.iter().any(|b| b == command_bin(ctx.command));
    let allowlisted = safe_bin
        || command_matches_any(&policy.allowed_globs, ctx.command)
        || command_matches_any(&store.persisted_allowlist(), ctx.command);

    let need_ask = match policy.ask {
        ExecAskMode::Always => true,
        ExecAskMode::Off => false,
        ExecAskMode::OnMiss => !allowlisted,
    };

    if !need_ask {
        return GateOutcome::Proceed;
    }

    let (tx, rx) = oneshot::channel();
    let now = Utc::now();
    let pending = PendingApproval {
        id: Uuid::new_v4(),
        run_id: ctx.run_id,
        session_key: ctx.session_key.to_string(),
        agent_id: ctx.agent_id.map(String::from),
        command: ctx.command.to_string(),
        host: policy.host,
        node_ref: None,
        cwd: ctx.cwd.map(String::from),
        env: ctx.env,
        rationale: None,
        created_at: now,
        expires_at: now
            + chrono::Duration::from_std(store.timeout())
                .unwrap_or_else(|_| chrono::Duration::seconds(300)),
        respond: tx,
    };

    match store.await_decision(pending, rx).await {
        ApprovalStatus::AllowOnce | ApprovalStatus::AllowAlways => GateOutcome::Proceed,
        ApprovalStatus::Denied => GateOutcome::Denied("exec call denied by approval".into()),
        ApprovalStatus::Expired => GateOutcome::Denied("exec approval request timed out".into()),
        ApprovalStatus::Pending => GateOutcome::Denied("exec approval unresolved".into()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (ApprovalStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        (ApprovalStore::new(Duration::from_millis(200), dir.path()), dir)
    }

    fn make_pending() -> (PendingApproval, oneshot::Receiver<ApprovalDecision>) {
        let (tx, rx) = oneshot::channel();
        let now = Utc::now();
        let pending = PendingApproval {
            id: Uuid::new_v4(),
            run_id: Some(Uuid::new_v4()),
            session_key: "sk_test".into(),
            agent_id: Some("agent-1".into()),
            command: "rm -rf /tmp/test".into(),
            host: ExecHost::Sandbox,
            node_ref: None,
            cwd: Some("/tmp".into()),
            env: vec![],
            rationale: Some("cleanup".into()),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(300),
            respond: tx,
        };
        (pending, rx)
    }

    #[test]
    fn insert_and_list() {
        let (store, _dir) = make_store();
        let (pending, _rx) = make_pending();
        let id = pending.id;
        store.insert(pending);

        let list = store.list_pending();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, id);
        assert_eq!(list[0].status, ApprovalStatus::Pending);
    }

    #[tokio::test]
    async fn allow_once_resolves_without_persisting() {
        let (store, _dir) = make_store();
        let (pending, rx) = make_pending();
        let id = pending.id;
        store.insert(pending);

        assert!(store.resolve(&id, ApprovalDecision::AllowOnce));
        let decision = rx.await.unwrap();
        assert!(matches!(decision, ApprovalDecision::AllowOnce));
        assert!(store.list_pending().is_empty());
        assert!(store.persisted_allowlist().is_empty());
    }

    #[tokio::test]
    async fn allow_always_persists_command() {
        let (store, _dir) = make_store();
        let (pending, rx) = make_pending();
        let id = pending.id;
        let command = pending.command.clone();
        store.insert(pending);

        assert!(store.resolve(&id, ApprovalDecision::AllowAlways));
        let decision = rx.await.unwrap();
        assert!(matches!(decision, ApprovalDecision::AllowAlways));
        assert_eq!(store.persisted_allowlist(), vec![command]);
    }

    #[tokio::test]
    async fn deny_resolves_channel_with_reason() {
        let (store, _dir) = make_store();
        let (pending, rx) = make_pending();
        let id = pending.id;
        store.insert(pending);

        assert!(store.resolve(&id, ApprovalDecision::Denied { reason: Some("too dangerous".into()) }));
        let decision = rx.await.unwrap();
        match decision {
            ApprovalDecision::Denied { reason } => {
                assert_eq!(reason.as_deref(), Some("too dangerous"));
            }
            _ => panic!("expected Denied"),
        }
    }

    #[test]
    fn resolve_nonexistent_returns_false() {
        let (store, _dir) = make_store();
        assert!(!store.resolve(&Uuid::new_v4(), ApprovalDecision::AllowOnce));
    }

    #[test]
    fn remove_expired() {
        let (store, _dir) = make_store();
        let (pending, _rx) = make_pending();
        let id = pending.id;
        store.insert(pending);

        store.remove_expired(&id);
        assert!(store.list_pending().is_empty());
    }

    #[tokio::test]
    async fn await_decision_times_out_to_expired() {
        let (store, _dir) = make_store();
        let (pending, _rx) = make_pending();

        let status = store.await_decision(pending, _rx_placeholder()).await;
        assert_eq!(status, ApprovalStatus::Expired);
        assert!(store.list_pending().is_empty());
    }

    fn _rx_placeholder() -> oneshot::Receiver<ApprovalDecision> {
        let (_tx, rx) = oneshot::channel();
        rx
    }

    #[tokio::test]
    async fn await_decision_resolves_before_timeout() {
        let (store, _dir) = make_store();
        let (tx, rx) = oneshot::channel();
        let now = Utc::now();
        let pending = PendingApproval {
            id: Uuid::new_v4(),
            run_id: None,
            session_key: "sk".into(),
            agent_id: None,
            command: "ls".into(),
            host: ExecHost::Gateway,
            node_ref: None,
            cwd: None,
            env: vec![],
            rationale: None,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(300),
            respond: tx,
        };
        let id = pending.id;
        let store_ref = &store;
        let (resolved, status) = tokio::join!(
            async { store_ref.await_decision(pending, rx).await },
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                store_ref.resolve(&id, ApprovalDecision::AllowOnce)
            }
        );
        assert_eq!(resolved, ApprovalStatus::AllowOnce);
        assert!(status);
    }

    #[test]
    fn timeout_returns_configured_duration() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::new(Duration::from_secs(60), dir.path());
        assert_eq!(store.timeout(), Duration::from_secs(60));
    }

    #[test]
    fn persisted_allowlist_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = ApprovalStore::new(Duration::from_secs(60), dir.path());
        store.remember_always("echo hi");

        let reloaded = ApprovalStore::new(Duration::from_secs(60), dir.path());
        assert_eq!(reloaded.persisted_allowlist(), vec!["echo hi".to_string()]);
    }

    fn ctx<'a>(command: &'a str, session_key: &'a str) -> ExecCallContext<'a> {
        ExecCallContext {
            command,
            session_key,
            run_id: None,
            agent_id: None,
            cwd: None,
            env: vec![],
        }
    }

    #[tokio::test]
    async fn deny_security_rejects_without_asking() {
        let (store, _dir) = make_store();
        let policy = ExecPolicy {
            security: ExecSecurityLevel::Deny,
            ..ExecPolicy::default()
        };
        let outcome = gate(&policy, &store, ctx("ls", "sk")).await;
        assert!(matches!(outcome, GateOutcome::Denied(_)));
        assert!(store.list_pending().is_empty());
    }

    #[tokio::test]
    async fn ask_off_proceeds_without_asking() {
        let (store, _dir) = make_store();
        let policy = ExecPolicy {
            ask: ExecAskMode::Off,
            ..ExecPolicy::default()
        };
        let outcome = gate(&policy, &store, ctx("rm -rf /nonexistent", "sk")).await;
        assert!(matches!(outcome, GateOutcome::Proceed));
    }

    #[tokio::test]
    async fn safe_bin_bypasses_allowlist_check() {
        let (store, _dir) = make_store();
        let policy = ExecPolicy {
            ask: ExecAskMode::OnMiss,
            ..ExecPolicy::default()
        };
        assert!(policy.safe_bins.contains(&"git".to_string()));
        let outcome = gate(&policy, &store, ctx("git status --short", "sk")).await;
        assert!(matches!(outcome, GateOutcome::Proceed));
    }

    #[test]
    fn command_bin_takes_first_token() {
        assert_eq!(command_bin("git status --short"), "git");
        assert_eq!(command_bin("  ls  "), "ls");
    }

    #[test]
    fn glob_matches_resolved_path() {
        assert!(command_matches_any(&["/usr/bin/*".to_string()], "/usr/bin/ls -la"));
        assert!(!command_matches_any(&["/usr/bin/*".to_string()], "/usr/local/bin/ls"));
    }

    #[tokio::test]
    async fn on_miss_asks_only_when_not_allowlisted() {
        let (store, _dir) = make_store();
        let policy = ExecPolicy {
            ask: ExecAskMode::OnMiss,
            allowed_globs: vec!["git *".to_string()],
            ..ExecPolicy::default()
        };
        let outcome = gate(&policy, &store, ctx("git status", "sk")).await;
        assert!(matches!(outcome, GateOutcome::Proceed));
    }

    #[tokio::test]
    async fn on_miss_times_out_for_unlisted_command() {
        let (store, _dir) = make_store();
        let policy = ExecPolicy {
            ask: ExecAskMode::OnMiss,
            ..ExecPolicy::default()
        };
        let outcome = gate(&policy, &store, ctx("curl https://example.com", "sk")).await;
        assert!(matches!(outcome, GateOutcome::Denied(_)));
    }
}
