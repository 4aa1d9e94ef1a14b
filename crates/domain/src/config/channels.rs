use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel adapter registration (spec.md §4.C, §6)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//
// The Gateway Core never implements a channel adapter itself — adapters
// are external collaborators (§1 Non-goals, §6 ChannelAdapter). This
// module only records the closed set of per-channel *policy* knobs the
// Ingress Normalizer (§4.C) needs: access control and group gating. Any
// adapter-specific credentials or transport config belong to the adapter,
// not here.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DmPolicy {
    Disabled,
    Open,
    Allowlist,
    /// Unknown senders are blocked until confirmed via an out-of-band
    /// approval (§4.C step 2).
    Pairing,
}

impl Default for DmPolicy {
    fn default() -> Self {
        DmPolicy::Allowlist
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    Disabled,
    Open,
    Allowlist,
}

impl Default for GroupPolicy {
    fn default() -> Self {
        GroupPolicy::Allowlist
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub dm_policy: DmPolicy,
    #[serde(default)]
    pub group_policy: GroupPolicy,
    /// Sender IDs allowlisted for DMs on this channel/account.
    #[serde(default)]
    pub allow_from: Vec<String>,
    /// Group IDs allowlisted when `group_policy = allowlist`.
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    /// Require an explicit mention/reply to accept a turn in groups,
    /// unless the session has `groupActivation = always`.
    #[serde(default = "d_true")]
    pub require_mention: bool,
    /// Record a "received" reaction on accepted inbound, never blocking.
    #[serde(default)]
    pub ack_reaction: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dm_policy: DmPolicy::default(),
            group_policy: GroupPolicy::default(),
            allow_from: Vec::new(),
            allowed_groups: Vec::new(),
            require_mention: true,
            ack_reaction: false,
        }
    }
}

fn d_true() -> bool {
    true
}

/// Per-channel policy, keyed by channel name (lowercased: "telegram",
/// "whatsapp", "discord", "slack", "signal", "imessage", "teams",
/// "webchat", "acp", "voice-call").
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    #[serde(flatten)]
    pub channels: HashMap<String, ChannelConfig>,
}

impl ChannelsConfig {
    pub fn get(&self, channel: &str) -> ChannelConfig {
        self.channels
            .get(&channel.to_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_dm_policy_is_allowlist() {
        assert_eq!(ChannelConfig::default().dm_policy, DmPolicy::Allowlist);
    }

    #[test]
    fn unregistered_channel_falls_back_to_default() {
        let cfg = ChannelsConfig::default();
        let c = cfg.get("telegram");
        assert!(!c.enabled);
        assert_eq!(c.dm_policy, DmPolicy::Allowlist);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let mut cfg = ChannelsConfig::default();
        cfg.channels.insert(
            "telegram".into(),
            ChannelConfig {
                enabled: true,
                ..ChannelConfig::default()
            },
        );
        assert!(cfg.get("Telegram").enabled);
        assert!(cfg.get("TELEGRAM").enabled);
    }
}
