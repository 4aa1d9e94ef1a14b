use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tools (exec / process)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for the built-in exec/process tools.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub exec_security: ExecSecurityConfig,
    /// Exec Approval Engine policy axes, applied globally and mergeable
    /// with a per-session override ("stricter of the two wins").
    #[serde(default)]
    pub exec_policy: ExecPolicy,
}

/// How aggressively exec calls require gating before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecSecurityLevel {
    /// Every command is rejected outright.
    Deny,
    /// Commands matching `allowed_globs` (or the safe-bins set) pass
    /// without asking; everything else follows `ask`.
    Allowlist,
    /// Every command is permitted to run, subject to `ask`.
    Full,
}

impl Default for ExecSecurityLevel {
    fn default() -> Self {
        ExecSecurityLevel::Allowlist
    }
}

/// When to route an exec call through the Exec Approval Engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecAskMode {
    /// Never prompt; decide purely from `security`/`denied_patterns`.
    Off,
    /// Prompt only when the command misses the allowlist.
    OnMiss,
    /// Prompt before every exec call regardless of allowlist status.
    Always,
}

impl Default for ExecAskMode {
    fn default() -> Self {
        ExecAskMode::OnMiss
    }
}

/// Where the command actually executes once approved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecHost {
    /// An isolated sandbox process the Gateway itself manages.
    Sandbox,
    /// The Gateway's own host.
    Gateway,
    /// A connected node (`gw-node-sdk`), addressed by `node_ref`.
    Node,
}

impl Default for ExecHost {
    fn default() -> Self {
        ExecHost::Sandbox
    }
}

/// Exec Approval Engine policy (§4.F): the axes a session or the global
/// config can set, merged with "stricter of global and session wins".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecPolicy {
    #[serde(default)]
    pub security: ExecSecurityLevel,
    #[serde(default)]
    pub ask: ExecAskMode,
    #[serde(default)]
    pub host: ExecHost,
    /// Case-insensitive shell-glob patterns matched against the resolved
    /// absolute command path when `security = allowlist`.
    #[serde(default)]
    pub allowed_globs: Vec<String>,
    /// Bins that bypass the allowlist check entirely (still subject to
    /// `denied_patterns` and `ask = always`).
    #[serde(default = "d_safe_bins")]
    pub safe_bins: Vec<String>,
}

impl Default for ExecPolicy {
    fn default() -> Self {
        Self {
            security: ExecSecurityLevel::default(),
            ask: ExecAskMode::default(),
            host: ExecHost::default(),
            allowed_globs: Vec::new(),
            safe_bins: d_safe_bins(),
        }
    }
}

/// Merge global and session-level policy, taking the stricter value on
/// each axis independently (§4.F "stricter of global and session wins").
impl ExecPolicy {
    pub fn merge_stricter(&self, session: &ExecPolicy) -> ExecPolicy {
        fn strict_security(a: ExecSecurityLevel, b: ExecSecurityLevel) -> ExecSecurityLevel {
            use ExecSecurityLevel::*;
            match (a, b) {
                (Deny, _) | (_, Deny) => Deny,
                (Allowlist, _) | (_, Allowlist) => Allowlist,
                (Full, Full) => Full,
            }
        }
        fn strict_ask(a: ExecAskMode, b: ExecAskMode) -> ExecAskMode {
            use ExecAskMode::*;
            match (a, b) {
                (Always, _) | (_, Always) => Always,
                (OnMiss, _) | (_, OnMiss) => OnMiss,
                (Off, Off) => Off,
            }
        }
        ExecPolicy {
            security: strict_security(self.security, session.security),
            ask: strict_ask(self.ask, session.ask),
            host: session.host,
            allowed_globs: session.allowed_globs.clone(),
            safe_bins: self.safe_bins.clone(),
        }
    }
}

fn d_safe_bins() -> Vec<String> {
    vec![
        "ls".into(),
        "cat".into(),
        "pwd".into(),
        "echo".into(),
        "git".into(),
    ]
}

/// Exec tool configuration (matches OpenClaw semantics).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Default yield time in ms before auto-backgrounding (0 = always foreground).
    #[serde(default = "d_10000")]
    pub background_ms: u64,
    /// Hard timeout for foreground commands (seconds).
    #[serde(default = "d_1800")]
    pub timeout_sec: u64,
    /// TTL for finished process sessions before cleanup (ms).
    #[serde(default = "d_1800000")]
    pub cleanup_ms: u64,
    /// Max output chars kept per process session.
    #[serde(default = "d_1000000")]
    pub max_output_chars: usize,
    /// Max pending output chars buffered before drain.
    #[serde(default = "d_500000")]
    pub pending_max_output_chars: usize,
    /// Notify when a background process exits.
    #[serde(default = "d_true")]
    pub notify_on_exit: bool,
    /// Skip notification if exit code is 0 and output is empty.
    #[serde(default)]
    pub notify_on_exit_empty_success: bool,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            background_ms: 10_000,
            timeout_sec: 1800,
            cleanup_ms: 1_800_000,
            max_output_chars: 1_000_000,
            pending_max_output_chars: 500_000,
            notify_on_exit: true,
            notify_on_exit_empty_success: false,
        }
    }
}

/// Security configuration for the exec tool — audit logging and command denylist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecSecurityConfig {
    /// Log every exec invocation at INFO level.
    #[serde(default = "d_true")]
    pub audit_log: bool,
    /// Regex patterns that are denied outright, independent of `ExecPolicy`.
    /// Commands matching any pattern are rejected before the Exec Approval
    /// Engine is ever consulted.
    #[serde(default = "d_denied_patterns")]
    pub denied_patterns: Vec<String>,
    /// How long a human has to resolve a pending exec approval before it
    /// expires.
    #[serde(default = "d_300")]
    pub approval_timeout_sec: u64,
}

impl Default for ExecSecurityConfig {
    fn default() -> Self {
        Self {
            audit_log: true,
            denied_patterns: d_denied_patterns(),
            approval_timeout_sec: d_300(),
        }
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_10000() -> u64 {
    10_000
}
fn d_1800() -> u64 {
    1800
}
fn d_300() -> u64 {
    300
}
fn d_1800000() -> u64 {
    1_800_000
}
fn d_1000000() -> usize {
    1_000_000
}
fn d_500000() -> usize {
    500_000
}
fn d_true() -> bool {
    true
}
fn d_denied_patterns() -> Vec<String> {
    vec![
        r"rm\s+-rf\s+/".into(),
        r"mkfs\.".into(),
        r"dd\s+if=.+of=/dev/".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_allowlist_on_miss() {
        let p = ExecPolicy::default();
        assert_eq!(p.security, ExecSecurityLevel::Allowlist);
        assert_eq!(p.ask, ExecAskMode::OnMiss);
        assert!(p.safe_bins.contains(&"git".to_string()));
    }

    #[test]
    fn merge_takes_stricter_security() {
        let global = ExecPolicy {
            security: ExecSecurityLevel::Full,
            ..ExecPolicy::default()
        };
        let session = ExecPolicy {
            security: ExecSecurityLevel::Deny,
            ..ExecPolicy::default()
        };
        assert_eq!(global.merge_stricter(&session).security, ExecSecurityLevel::Deny);
    }

    #[test]
    fn merge_takes_stricter_ask() {
        let global = ExecPolicy {
            ask: ExecAskMode::Off,
            ..ExecPolicy::default()
        };
        let session = ExecPolicy {
            ask: ExecAskMode::Always,
            ..ExecPolicy::default()
        };
        assert_eq!(global.merge_stricter(&session).ask, ExecAskMode::Always);
    }

    #[test]
    fn merge_takes_session_host_and_globs() {
        let global = ExecPolicy::default();
        let session = ExecPolicy {
            host: ExecHost::Node,
            allowed_globs: vec!["/usr/bin/*".into()],
            ..ExecPolicy::default()
        };
        let merged = global.merge_stricter(&session);
        assert_eq!(merged.host, ExecHost::Node);
        assert_eq!(merged.allowed_globs, vec!["/usr/bin/*".to_string()]);
    }
}
