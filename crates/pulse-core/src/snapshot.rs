use crate::{AgentStatus, UNKNOWN_MODEL};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use thiserror::Error;

pub const ACTIVE_WINDOW_MINUTES: i64 = 5;
pub const IDLE_WINDOW_MINUTES: i64 = 60;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed session data in {path}: {message}")]
    Malformed { path: PathBuf, message: String },
}

/// Anything that can reconstruct the current agent state on demand.
pub trait SnapshotSource: Send + Sync {
    fn take_snapshot(&self) -> Result<Snapshot, SnapshotError>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub key: String,
    #[serde(default)]
    pub model: Option<String>,
    pub total_tokens: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    pub live: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentState {
    pub agent_id: String,
    pub status: AgentStatus,
    pub current_model: String,
    pub total_tokens: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub context_usage_percent: f64,
    pub last_activity: DateTime<Utc>,
    pub tools_used: BTreeSet<String>,
    pub sessions: Vec<SessionSummary>,
}

impl AgentState {
    pub fn new(agent_id: impl Into<String>, status: AgentStatus, last_activity: DateTime<Utc>) -> Self {
        Self {
            agent_id: agent_id.into(),
            status,
            current_model: UNKNOWN_MODEL.to_string(),
            total_tokens: 0,
            input_tokens: 0,
            output_tokens: 0,
            context_usage_percent: 0.0,
            last_activity,
            tools_used: BTreeSet::new(),
            sessions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub agents: BTreeMap<String, AgentState>,
}

impl Snapshot {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            agents: BTreeMap::new(),
        }
    }

    pub fn from_agents(timestamp: DateTime<Utc>, agents: impl IntoIterator<Item = AgentState>) -> Self {
        let agents = agents
            .into_iter()
            .map(|agent| (agent.agent_id.clone(), agent))
            .collect();
        Self { timestamp, agents }
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentState> {
        self.agents.get(agent_id)
    }

    pub fn total_sessions(&self) -> usize {
        self.agents.values().map(|agent| agent.sessions.len()).sum()
    }

    pub fn total_tokens(&self) -> u64 {
        self.agents
            .values()
            .fold(0u64, |total, agent| total.saturating_add(agent.total_tokens))
    }
}

/// Recency-based status. No hysteresis: an agent near the active window edge
/// can alternate between active and idle on consecutive polls.
pub fn classify_status(
    now: DateTime<Utc>,
    last_update: DateTime<Utc>,
    has_live_session_records: bool,
) -> AgentStatus {
    let age = now.signed_duration_since(last_update);
    if has_live_session_records && age < Duration::minutes(ACTIVE_WINDOW_MINUTES) {
        AgentStatus::Active
    } else if age < Duration::minutes(IDLE_WINDOW_MINUTES) {
        AgentStatus::Idle
    } else {
        AgentStatus::Ended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn live_and_recent_is_active() {
        let status = classify_status(now(), now() - Duration::minutes(4), true);
        assert_eq!(status, AgentStatus::Active);
    }

    #[test]
    fn recent_without_live_sessions_is_idle() {
        let status = classify_status(now(), now() - Duration::seconds(10), false);
        assert_eq!(status, AgentStatus::Idle);
    }

    #[test]
    fn active_window_edge_is_exclusive() {
        let status = classify_status(now(), now() - Duration::minutes(5), true);
        assert_eq!(status, AgentStatus::Idle);
    }

    #[test]
    fn idle_window_edge_is_exclusive() {
        let inside = classify_status(now(), now() - Duration::minutes(59), true);
        let edge = classify_status(now(), now() - Duration::minutes(60), true);
        assert_eq!(inside, AgentStatus::Idle);
        assert_eq!(edge, AgentStatus::Ended);
    }

    #[test]
    fn aggregates_sum_over_agents() {
        let mut alpha = AgentState::new("alpha", AgentStatus::Active, now());
        alpha.total_tokens = 1_200;
        alpha.sessions.push(SessionSummary {
            session_id: "s1".to_string(),
            key: "main".to_string(),
            model: None,
            total_tokens: 1_200,
            updated_at: None,
            live: true,
        });
        let mut beta = AgentState::new("beta", AgentStatus::Idle, now());
        beta.total_tokens = 300;

        let snapshot = Snapshot::from_agents(now(), [alpha, beta]);
        assert_eq!(snapshot.total_tokens(), 1_500);
        assert_eq!(snapshot.total_sessions(), 1);
        assert!(snapshot.agent("beta").is_some());
    }

    #[test]
    fn token_aggregate_saturates() {
        let mut big = AgentState::new("big", AgentStatus::Active, now());
        big.total_tokens = u64::MAX;
        let mut ok = AgentState::new("ok", AgentStatus::Active, now());
        ok.total_tokens = 12;

        let snapshot = Snapshot::from_agents(now(), [big, ok]);
        assert_eq!(snapshot.total_tokens(), u64::MAX);
    }
}
