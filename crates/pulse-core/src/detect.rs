use crate::snapshot::{AgentState, Snapshot};
use crate::{is_known_model, AgentStatus};
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleChange {
    pub agent_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub previous_status: Option<AgentStatus>,
    pub current_status: AgentStatus,
    /// Current state of the agent; `None` when it vanished from the snapshot.
    pub state: Option<AgentState>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSwitch {
    pub agent_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDelta {
    pub agent_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub delta: i64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolObservation {
    pub agent_id: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub tool: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Lifecycle(LifecycleChange),
    ModelSwitch(ModelSwitch),
    TokenDelta(TokenDelta),
    ToolUsage(ToolObservation),
}

impl ChangeEvent {
    pub fn agent_id(&self) -> &str {
        match self {
            ChangeEvent::Lifecycle(change) => &change.agent_id,
            ChangeEvent::ModelSwitch(change) => &change.agent_id,
            ChangeEvent::TokenDelta(change) => &change.agent_id,
            ChangeEvent::ToolUsage(change) => &change.agent_id,
        }
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            ChangeEvent::Lifecycle(change) => change.timestamp,
            ChangeEvent::ModelSwitch(change) => change.timestamp,
            ChangeEvent::TokenDelta(change) => change.timestamp,
            ChangeEvent::ToolUsage(change) => change.timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub lifecycle: Vec<LifecycleChange>,
    pub model_switches: Vec<ModelSwitch>,
    pub token_deltas: Vec<TokenDelta>,
    pub tool_observations: Vec<ToolObservation>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.lifecycle.len()
            + self.model_switches.len()
            + self.token_deltas.len()
            + self.tool_observations.len()
    }

    /// Flattens the categories in delivery order: lifecycle, model, token, tool.
    pub fn into_events(self) -> Vec<ChangeEvent> {
        let mut events = Vec::with_capacity(self.len());
        events.extend(self.lifecycle.into_iter().map(ChangeEvent::Lifecycle));
        events.extend(self.model_switches.into_iter().map(ChangeEvent::ModelSwitch));
        events.extend(self.token_deltas.into_iter().map(ChangeEvent::TokenDelta));
        events.extend(self.tool_observations.into_iter().map(ChangeEvent::ToolUsage));
        events
    }
}

/// Fills in the model of every agent in `current` that reports no known model
/// with the model it last had in `previous`. Applied before `detect`, this
/// keeps a read that loses the model from hiding the next real switch.
pub fn carry_known_models(previous: Option<&Snapshot>, current: &mut Snapshot) {
    let Some(previous) = previous else {
        return;
    };
    for (agent_id, state) in current.agents.iter_mut() {
        if is_known_model(&state.current_model) {
            continue;
        }
        if let Some(prior) = previous.agents.get(agent_id) {
            if is_known_model(&prior.current_model) {
                state.current_model = prior.current_model.clone();
            }
        }
    }
}

/// Computes what changed between two consecutive snapshots.
///
/// Agents first seen in `current` only produce a lifecycle change; their
/// initial model, tokens and tools travel in that change's state. Model
/// switches are reported only between two known models. Snapshots passed
/// through `carry_known_models` keep the last known model, so `from` is that
/// model even when a read in between lost it.
pub fn detect(previous: Option<&Snapshot>, current: &Snapshot) -> ChangeSet {
    let stamp = Some(current.timestamp);
    let mut changes = ChangeSet::default();

    for (agent_id, state) in &current.agents {
        let Some(prior) = previous.and_then(|snapshot| snapshot.agents.get(agent_id)) else {
            changes.lifecycle.push(LifecycleChange {
                agent_id: agent_id.clone(),
                timestamp: stamp,
                previous_status: None,
                current_status: state.status,
                state: Some(state.clone()),
            });
            continue;
        };

        if prior.status != state.status {
            changes.lifecycle.push(LifecycleChange {
                agent_id: agent_id.clone(),
                timestamp: stamp,
                previous_status: Some(prior.status),
                current_status: state.status,
                state: Some(state.clone()),
            });
        }

        if is_known_model(&prior.current_model)
            && is_known_model(&state.current_model)
            && prior.current_model != state.current_model
        {
            changes.model_switches.push(ModelSwitch {
                agent_id: agent_id.clone(),
                timestamp: stamp,
                from: prior.current_model.clone(),
                to: state.current_model.clone(),
            });
        }

        let delta = state.total_tokens.wrapping_sub(prior.total_tokens) as i64;
        if delta != 0 {
            changes.token_deltas.push(TokenDelta {
                agent_id: agent_id.clone(),
                timestamp: stamp,
                delta,
                input_tokens: state.input_tokens,
                output_tokens: state.output_tokens,
                total_tokens: state.total_tokens,
            });
        }

        for tool in state.tools_used.difference(&prior.tools_used) {
            changes.tool_observations.push(ToolObservation {
                agent_id: agent_id.clone(),
                timestamp: stamp,
                tool: tool.clone(),
            });
        }
    }

    if let Some(previous) = previous {
        for (agent_id, prior) in &previous.agents {
            if current.agents.contains_key(agent_id) || prior.status.is_ended() {
                continue;
            }
            changes.lifecycle.push(LifecycleChange {
                agent_id: agent_id.clone(),
                timestamp: stamp,
                previous_status: Some(prior.status),
                current_status: AgentStatus::Ended,
                state: None,
            });
        }
        changes
            .lifecycle
            .sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
    }

    changes
}
