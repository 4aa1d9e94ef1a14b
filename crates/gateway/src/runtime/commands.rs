//! Directive command dispatch.
//!
//! Directives starting with `/` (`/think`, `/verbose`, `/reasoning`,
//! `/model`, `/new`, `/reset`, `/stop`, `/help`) are interpreted by the Run
//! Controller before a message ever reaches the LLM. Directive-only
//! messages mutate the session's settings (via `SessionStore::
//! update_settings`, grounded on `api/sessions.rs`'s existing reset/stop
//! endpoints) and never enter the transcript.
//!
//! `/think` and `/reasoning` are treated as synonyms: `SessionEntry` has a
//! single `ThinkingLevel` field, not a separate reasoning-effort axis, so
//! both commands parse the same `{off,minimal,low,medium,high,xhigh}`
//! vocabulary and set the same field.

use gw_sessions::settings::{GroupActivation, ThinkingLevel, VerboseLevel};
use gw_sessions::store::SessionSettingsUpdate;

use crate::state::AppState;

/// Outcome of dispatching a directive. `None` from [`dispatch`] means the
/// text wasn't a recognized command at all.
pub struct CommandReply {
    pub text: String,
    /// `/stop` requests the Run Controller abort any in-flight turn for
    /// this session in addition to returning a reply.
    pub abort_running_turn: bool,
}

fn reply(text: impl Into<String>) -> CommandReply {
    CommandReply {
        text: text.into(),
        abort_running_turn: false,
    }
}

const HELP_TEXT: &str = "\
Commands:
  /think <off|minimal|low|medium|high|xhigh>  — set reasoning depth
  /reasoning <level>                          — alias for /think
  /verbose <off|on|full>                      — set turn-by-turn detail
  /model <provider/model>                     — override this session's model
  /new                                        — start a fresh session (new id, same key)
  /reset                                      — alias for /new
  /stop                                       — abort the in-progress turn
  /help                                       — show this message";

fn parse_thinking_level(arg: &str) -> Option<ThinkingLevel> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "off" => Some(ThinkingLevel::Off),
        "minimal" => Some(ThinkingLevel::Minimal),
        "low" => Some(ThinkingLevel::Low),
        "medium" => Some(ThinkingLevel::Medium),
        "high" => Some(ThinkingLevel::High),
        "xhigh" => Some(ThinkingLevel::Xhigh),
        _ => None,
    }
}

fn parse_verbose_level(arg: &str) -> Option<VerboseLevel> {
    match arg.trim().to_ascii_lowercase().as_str() {
        "off" => Some(VerboseLevel::Off),
        "on" => Some(VerboseLevel::On),
        "full" => Some(VerboseLevel::Full),
        _ => None,
    }
}

/// Split a `/command args...` line into (`command`, `args`).
fn split_command(line: &str) -> (&str, &str) {
    let trimmed = line.trim_start().trim_start_matches('/');
    match trimmed.split_once(char::is_whitespace) {
        Some((cmd, args)) => (cmd, args.trim_start()),
        None => (trimmed, ""),
    }
}

/// Attempt to interpret `body_for_commands` as one of the recognized
/// directives. Returns `None` if `body_for_commands` is `None`, or `Some`
/// with the reply + mutated session state otherwise — including a reply
/// for an unrecognized `/foo`, since a slash-prefixed message the user
/// plainly meant as a command should not silently fall through to the LLM.
pub fn dispatch(
    state: &AppState,
    session_key: &str,
    body_for_commands: Option<&str>,
) -> Option<CommandReply> {
    let line = body_for_commands?;
    let (cmd, args) = split_command(line);

    Some(match cmd.to_ascii_lowercase().as_str() {
        "think" | "reasoning" => match parse_thinking_level(args) {
            Some(level) => {
                state.sessions.update_settings(
                    session_key,
                    SessionSettingsUpdate {
                        thinking_level: Some(level),
                        ..Default::default()
                    },
                );
                reply(format!("thinking level set to {args}"))
            }
            None => reply("usage: /think <off|minimal|low|medium|high|xhigh>"),
        },
        "verbose" => match parse_verbose_level(args) {
            Some(level) => {
                state.sessions.update_settings(
                    session_key,
                    SessionSettingsUpdate {
                        verbose_level: Some(level),
                        ..Default::default()
                    },
                );
                reply(format!("verbose level set to {args}"))
            }
            None => reply("usage: /verbose <off|on|full>"),
        },
        "model" => {
            if args.is_empty() {
                reply("usage: /model <provider/model>")
            } else {
                state.sessions.update_settings(
                    session_key,
                    SessionSettingsUpdate {
                        model_override: Some(Some(args.to_string())),
                        ..Default::default()
                    },
                );
                reply(format!("model override set to {args}"))
            }
        }
        "new" | "reset" => {
            state.sessions.reset_session(session_key, "/".to_string() + cmd);
            reply("started a new session")
        }
        "stop" => CommandReply {
            text: "stopping the current run".to_string(),
            abort_running_turn: true,
        },
        "help" => reply(HELP_TEXT),
        // Unrecognized slash command: still a command-shaped message, so
        // don't silently hand it to the LLM — tell the user.
        other => reply(format!("unrecognized command /{other}. Try /help.")),
    })
}

/// Clears the group-activation override back to its default (`Mention`).
/// Not wired to a `/` directive yet — kept for the RPC `sessions.*`
/// surface, which can set it without going through chat text.
#[allow(dead_code)]
pub fn set_group_activation(state: &AppState, session_key: &str, activation: GroupActivation) {
    state.sessions.update_settings(
        session_key,
        SessionSettingsUpdate {
            group_activation: Some(activation),
            ..Default::default()
        },
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_command_with_args() {
        assert_eq!(split_command("/think high"), ("think", "high"));
    }

    #[test]
    fn split_command_bare() {
        assert_eq!(split_command("/stop"), ("stop", ""));
    }

    #[test]
    fn parse_thinking_level_rejects_garbage() {
        assert_eq!(parse_thinking_level("ludicrous"), None);
        assert_eq!(parse_thinking_level("High"), Some(ThinkingLevel::High));
    }

    #[test]
    fn parse_verbose_level_accepts_known_values() {
        assert_eq!(parse_verbose_level("full"), Some(VerboseLevel::Full));
        assert_eq!(parse_verbose_level("loud"), None);
    }
}
