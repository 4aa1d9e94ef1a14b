//! Per-session behavioral settings: how much the agent reasons out loud,
//! how verbose its turns are, and when it should speak up unprompted in a
//! group chat.

use serde::{Deserialize, Serialize};

/// How much of the model's reasoning is surfaced to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Minimal,
    Low,
    Medium,
    High,
    Xhigh,
}

/// How much turn-by-turn detail (tool calls, intermediate steps) is shown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerboseLevel {
    #[default]
    Off,
    On,
    Full,
}

/// When the agent responds in a group/channel session without being
/// addressed directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GroupActivation {
    #[default]
    Mention,
    Always,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_least_intrusive_behavior() {
        assert_eq!(ThinkingLevel::default(), ThinkingLevel::Off);
        assert_eq!(VerboseLevel::default(), VerboseLevel::Off);
        assert_eq!(GroupActivation::default(), GroupActivation::Mention);
    }

    #[test]
    fn round_trips_through_json() {
        let v = serde_json::to_string(&ThinkingLevel::Xhigh).unwrap();
        assert_eq!(v, "\"xhigh\"");
        let back: ThinkingLevel = serde_json::from_str(&v).unwrap();
        assert_eq!(back, ThinkingLevel::Xhigh);

        let v = serde_json::to_string(&GroupActivation::Always).unwrap();
        assert_eq!(v, "\"always\"");
    }
}
