//! Ingress Normalizer — turns a per-channel inbound payload into a canonical
//! decision before a session is ever touched.
//!
//! State-free: every function here takes its config and metadata as plain
//! arguments and returns a decision, so the pipeline can be unit tested
//! without an `AppState`. `api/inbound.rs` is the only caller; it owns the
//! session-key/session-store/turn-execution steps this module doesn't.

use gw_domain::config::{ChannelConfig, DmPolicy, GroupPolicy};

/// Why an inbound payload was blocked before a session was touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    /// Step 1: payload didn't parse against the channel's schema.
    Unparseable,
    /// Step 2: DM/group access policy denied the sender or group.
    Policy,
    /// Step 3: group gating requires a mention/reply/activation override
    /// that wasn't present.
    NotActivated,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::Unparseable => "unparseable",
            BlockReason::Policy => "policy",
            BlockReason::NotActivated => "not-activated",
        }
    }
}

/// Minimal view of an inbound payload's access-control-relevant fields.
/// Constructed by the caller from its channel-specific envelope.
#[derive(Debug, Clone)]
pub struct AccessRequest<'a> {
    pub is_direct: bool,
    pub sender_id: &'a str,
    pub group_id: Option<&'a str>,
    /// Whether this sender has an out-of-band-confirmed pairing (only
    /// consulted under `DmPolicy::Pairing`).
    pub is_paired: bool,
}

/// Step 2 (access control) + step 3 (group gating), minus rate/ack (step 4,
/// which never blocks and is handled by the caller as a side effect).
///
/// `is_mentioned` covers "bot is mentioned, replied to, or a reply-to
/// target" per the tie-break rule (reply-to takes precedence over mentions,
/// but both collapse to the same boolean here since the normalizer only
/// needs to know whether one of them fired).
pub fn check_access(
    channel: &ChannelConfig,
    req: &AccessRequest<'_>,
    is_mentioned: bool,
    group_activation_always: bool,
) -> Result<(), BlockReason> {
    if !channel.enabled {
        return Err(BlockReason::Policy);
    }

    if req.is_direct {
        match channel.dm_policy {
            DmPolicy::Disabled => return Err(BlockReason::Policy),
            DmPolicy::Open => {}
            DmPolicy::Allowlist => {
                if !channel.allow_from.iter().any(|id| id == req.sender_id) {
                    return Err(BlockReason::Policy);
                }
            }
            DmPolicy::Pairing => {
                if !req.is_paired && !channel.allow_from.iter().any(|id| id == req.sender_id) {
                    return Err(BlockReason::Policy);
                }
            }
        }
        return Ok(());
    }

    match channel.group_policy {
        GroupPolicy::Disabled => return Err(BlockReason::Policy),
        GroupPolicy::Open => {}
        GroupPolicy::Allowlist => {
            let allowed = req
                .group_id
                .map(|gid| channel.allowed_groups.iter().any(|g| g == gid))
                .unwrap_or(false);
            if !allowed {
                return Err(BlockReason::Policy);
            }
        }
    }

    if channel.require_mention && !is_mentioned && !group_activation_always {
        return Err(BlockReason::NotActivated);
    }

    Ok(())
}

/// Step 6: split a raw message into the text sent to the LLM and the text
/// retained for command interpretation. A message starting with `/` is a
/// command: `body_for_commands` keeps the whole line, `body_for_agent` is
/// the text after the command token (empty if the command has no
/// arguments), so command-only messages never reach the LLM as-is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitBody {
    pub body_for_agent: String,
    pub body_for_commands: Option<String>,
}

pub fn split_body(text: &str) -> SplitBody {
    let trimmed = text.trim_start();
    if let Some(rest) = trimmed.strip_prefix('/') {
        let body_for_agent = rest
            .split_once(char::is_whitespace)
            .map(|(_, args)| args.trim_start().to_string())
            .unwrap_or_default();
        return SplitBody {
            body_for_agent,
            body_for_commands: Some(trimmed.to_string()),
        };
    }

    SplitBody {
        body_for_agent: text.to_string(),
        body_for_commands: None,
    }
}

/// Collapse a payload's raw mention list into a single "was the bot
/// targeted" boolean, per the tie-break rule: multiple mentions collapse to
/// one, and an explicit reply-to takes precedence for session threading
/// (callers should prefer `reply_to_bot` when both are available).
pub fn is_bot_targeted(mentions_bot: bool, reply_to_bot: bool) -> bool {
    mentions_bot || reply_to_bot
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// InboundContext — canonical normalizer output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Chat container kind, independent of any one connector's wire vocabulary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    Direct,
    Group,
    Channel,
    Topic,
}

/// A mentioned user/role/channel, carried through from the raw payload.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MentionedId {
    pub kind: String,
    pub id: String,
}

/// Canonical form produced by the Ingress Normalizer from a per-channel
/// payload, before a session is ever touched. Every later stage (command
/// dispatch, the Run Controller, the RPC Hub's `chat.ingress`) consumes
/// this instead of a connector-specific envelope.
#[derive(Debug, Clone, serde::Serialize)]
pub struct InboundContext {
    // ── Identity ───────────────────────────────────────────────────
    pub provider: String,
    pub channel: String,
    pub account_id: Option<String>,
    pub sender_id: String,
    pub sender_e164: Option<String>,
    pub sender_name: Option<String>,
    pub sender_username: Option<String>,

    // ── Target ─────────────────────────────────────────────────────
    pub chat_type: ChatType,
    pub group_subject: Option<String>,
    pub conversation_id: String,
    pub reply_to_id: Option<String>,

    // ── Payload ────────────────────────────────────────────────────
    pub raw_body: String,
    pub body: String,
    pub body_for_agent: String,
    pub body_for_commands: Option<String>,
    pub attachments: Vec<serde_json::Value>,
    pub location: Option<serde_json::Value>,

    // ── Routing ────────────────────────────────────────────────────
    pub session_key: String,
    pub command_authorized: bool,
    pub was_mentioned: bool,
    pub mentioned_ids: Vec<MentionedId>,

    // ── Forwarding provenance ──────────────────────────────────────
    pub forwarded_from: Option<String>,
    pub forwarded_from_type: Option<String>,
    pub forwarded_date: Option<chrono::DateTime<chrono::Utc>>,
}

/// Plain-data inputs the caller has already resolved (session key, access
/// decision) plus the fields read straight off the wire envelope. Kept
/// separate from any one connector's envelope type so this module stays
/// state-free.
pub struct InboundContextInput<'a> {
    pub provider: &'a str,
    pub channel: &'a str,
    pub account_id: Option<&'a str>,
    pub sender_id: &'a str,
    pub sender_e164: Option<&'a str>,
    pub sender_name: Option<&'a str>,
    pub sender_username: Option<&'a str>,
    pub chat_type: ChatType,
    pub group_subject: Option<&'a str>,
    pub conversation_id: &'a str,
    pub reply_to_id: Option<&'a str>,
    pub raw_body: &'a str,
    pub attachments: Vec<serde_json::Value>,
    pub location: Option<serde_json::Value>,
    pub session_key: &'a str,
    /// Whether `CommandAuthorized`-gated directives (e.g. `/model`) are
    /// permitted for this sender (per-channel admin allowlist). Defaults
    /// to `true` for direct messages, `false` for groups unless the
    /// sender is allowlisted — callers compute this, not this module.
    pub command_authorized: bool,
    pub was_mentioned: bool,
    pub mentioned_ids: Vec<MentionedId>,
    pub forwarded_from: Option<&'a str>,
    pub forwarded_from_type: Option<&'a str>,
    pub forwarded_date: Option<chrono::DateTime<chrono::Utc>>,
}

impl InboundContext {
    /// Build the canonical context, splitting `raw_body` into
    /// `body_for_agent`/`body_for_commands` per [`split_body`].
    pub fn build(input: InboundContextInput<'_>) -> Self {
        let split = split_body(input.raw_body);
        Self {
            provider: input.provider.to_string(),
            channel: input.channel.to_string(),
            account_id: input.account_id.map(String::from),
            sender_id: input.sender_id.to_string(),
            sender_e164: input.sender_e164.map(String::from),
            sender_name: input.sender_name.map(String::from),
            sender_username: input.sender_username.map(String::from),
            chat_type: input.chat_type,
            group_subject: input.group_subject.map(String::from),
            conversation_id: input.conversation_id.to_string(),
            reply_to_id: input.reply_to_id.map(String::from),
            raw_body: input.raw_body.to_string(),
            body: input.raw_body.to_string(),
            body_for_agent: split.body_for_agent,
            body_for_commands: split.body_for_commands,
            attachments: input.attachments,
            location: input.location,
            session_key: input.session_key.to_string(),
            command_authorized: input.command_authorized,
            was_mentioned: input.was_mentioned,
            mentioned_ids: input.mentioned_ids,
            forwarded_from: input.forwarded_from.map(String::from),
            forwarded_from_type: input.forwarded_from_type.map(String::from),
            forwarded_date: input.forwarded_date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(dm: DmPolicy, group: GroupPolicy) -> ChannelConfig {
        ChannelConfig {
            enabled: true,
            dm_policy: dm,
            group_policy: group,
            allow_from: vec!["u1".to_string()],
            allowed_groups: vec!["g1".to_string()],
            require_mention: true,
            ack_reaction: false,
        }
    }

    fn dm_req(sender: &str) -> AccessRequest<'_> {
        AccessRequest {
            is_direct: true,
            sender_id: sender,
            group_id: None,
            is_paired: false,
        }
    }

    fn group_req<'a>(sender: &'a str, group: &'a str) -> AccessRequest<'a> {
        AccessRequest {
            is_direct: false,
            sender_id: sender,
            group_id: Some(group),
            is_paired: false,
        }
    }

    #[test]
    fn disabled_channel_blocks_everything() {
        let mut c = channel(DmPolicy::Open, GroupPolicy::Open);
        c.enabled = false;
        assert_eq!(
            check_access(&c, &dm_req("anyone"), false, false),
            Err(BlockReason::Policy)
        );
    }

    #[test]
    fn dm_allowlist_accepts_listed_sender() {
        let c = channel(DmPolicy::Allowlist, GroupPolicy::Disabled);
        assert_eq!(check_access(&c, &dm_req("u1"), false, false), Ok(()));
    }

    #[test]
    fn dm_allowlist_rejects_unlisted_sender() {
        let c = channel(DmPolicy::Allowlist, GroupPolicy::Disabled);
        assert_eq!(
            check_access(&c, &dm_req("stranger"), false, false),
            Err(BlockReason::Policy)
        );
    }

    #[test]
    fn dm_pairing_blocks_unpaired_unlisted_sender() {
        let c = channel(DmPolicy::Pairing, GroupPolicy::Disabled);
        assert_eq!(
            check_access(&c, &dm_req("stranger"), false, false),
            Err(BlockReason::Policy)
        );
    }

    #[test]
    fn dm_pairing_accepts_paired_sender() {
        let c = channel(DmPolicy::Pairing, GroupPolicy::Disabled);
        let mut req = dm_req("stranger");
        req.is_paired = true;
        assert_eq!(check_access(&c, &req, false, false), Ok(()));
    }

    #[test]
    fn group_allowlist_rejects_unlisted_group() {
        let c = channel(DmPolicy::Disabled, GroupPolicy::Allowlist);
        assert_eq!(
            check_access(&c, &group_req("u1", "other-group"), true, false),
            Err(BlockReason::Policy)
        );
    }

    #[test]
    fn group_requires_mention_when_not_activated() {
        let c = channel(DmPolicy::Disabled, GroupPolicy::Allowlist);
        assert_eq!(
            check_access(&c, &group_req("u1", "g1"), false, false),
            Err(BlockReason::NotActivated)
        );
    }

    #[test]
    fn group_activation_always_bypasses_mention_requirement() {
        let c = channel(DmPolicy::Disabled, GroupPolicy::Allowlist);
        assert_eq!(check_access(&c, &group_req("u1", "g1"), false, true), Ok(()));
    }

    #[test]
    fn group_mention_satisfies_gating() {
        let c = channel(DmPolicy::Disabled, GroupPolicy::Allowlist);
        assert_eq!(check_access(&c, &group_req("u1", "g1"), true, false), Ok(()));
    }

    #[test]
    fn split_body_plain_text_has_no_command() {
        let s = split_body("hello there");
        assert_eq!(s.body_for_agent, "hello there");
        assert_eq!(s.body_for_commands, None);
    }

    #[test]
    fn split_body_command_with_args_strips_prefix_for_agent() {
        let s = split_body("/reset now please");
        assert_eq!(s.body_for_agent, "now please");
        assert_eq!(s.body_for_commands.as_deref(), Some("/reset now please"));
    }

    #[test]
    fn split_body_bare_command_has_empty_agent_body() {
        let s = split_body("/reset");
        assert_eq!(s.body_for_agent, "");
        assert_eq!(s.body_for_commands.as_deref(), Some("/reset"));
    }

    #[test]
    fn is_bot_targeted_collapses_multiple_signals() {
        assert!(is_bot_targeted(true, true));
        assert!(is_bot_targeted(true, false));
        assert!(is_bot_targeted(false, true));
        assert!(!is_bot_targeted(false, false));
    }
}
