use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub mod detect;
pub mod encode;
pub mod snapshot;
pub mod wire;

pub use detect::{carry_known_models, detect, ChangeEvent, ChangeSet};
pub use encode::{encode, encode_all, sync_events};
pub use snapshot::{
    classify_status, AgentState, SessionSummary, Snapshot, SnapshotError, SnapshotSource,
};
pub use wire::{EventType, FrameError, WireEvent};

/// Model identifier used when no session declares one.
pub const UNKNOWN_MODEL: &str = "unknown";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Active,
    Idle,
    Ended,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Idle => "idle",
            AgentStatus::Ended => "ended",
        }
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, AgentStatus::Ended)
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentStatus {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let normalized = input.trim().to_lowercase();
        match normalized.as_str() {
            "active" | "running" => Ok(AgentStatus::Active),
            "idle" => Ok(AgentStatus::Idle),
            "ended" | "offline" | "stopped" => Ok(AgentStatus::Ended),
            other => Err(format!("Unknown status: {other}")),
        }
    }
}

pub fn is_known_model(model: &str) -> bool {
    let trimmed = model.trim();
    !trimmed.is_empty() && trimmed != UNKNOWN_MODEL
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_parses_aliases() {
        assert_eq!("Active".parse::<AgentStatus>(), Ok(AgentStatus::Active));
        assert_eq!("running".parse::<AgentStatus>(), Ok(AgentStatus::Active));
        assert_eq!(" offline ".parse::<AgentStatus>(), Ok(AgentStatus::Ended));
        assert!("sleeping".parse::<AgentStatus>().is_err());
    }

    #[test]
    fn unknown_and_blank_models_are_not_known() {
        assert!(!is_known_model("unknown"));
        assert!(!is_known_model("  "));
        assert!(is_known_model("k2p5"));
    }
}
