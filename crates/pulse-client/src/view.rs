use pulse_core::{AgentStatus, EventType, WireEvent, UNKNOWN_MODEL};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }

    fn from_payload(event: &WireEvent) -> Self {
        Self {
            input: event.payload_u64("input").unwrap_or(0),
            output: event.payload_u64("output").unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentActivity {
    pub agent_id: String,
    pub status: AgentStatus,
    pub model: String,
    pub tools: BTreeSet<String>,
    pub tokens: TokenUsage,
    pub last_seen: String,
}

/// Client-side projection of the event stream, keyed by agent id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ActivityView {
    agents: BTreeMap<String, AgentActivity>,
}

impl ActivityView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(&self, agent_id: &str) -> Option<&AgentActivity> {
        self.agents.get(agent_id)
    }

    pub fn agents(&self) -> impl Iterator<Item = &AgentActivity> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn fold(mut self, event: &WireEvent) -> Self {
        self.apply(event);
        self
    }

    fn apply(&mut self, event: &WireEvent) {
        match event.event_type {
            EventType::AgentStarted => {
                self.agents
                    .insert(event.agent_id.clone(), started_record(event));
            }
            EventType::AgentEnded => {
                if let Some(agent) = self.agents.get_mut(&event.agent_id) {
                    agent.status = AgentStatus::Ended;
                }
            }
            EventType::ToolCalled => {
                if let Some(agent) = self.touch(event) {
                    if let Some(tool) = event.payload_str("tool") {
                        agent.tools.insert(tool.to_string());
                    }
                }
            }
            EventType::ModelSwitched => {
                if let Some(agent) = self.touch(event) {
                    if let Some(model) = event.payload_str("model") {
                        agent.model = model.to_string();
                    }
                }
            }
            EventType::TokenUpdate => {
                if let Some(agent) = self.touch(event) {
                    agent.tokens = TokenUsage::from_payload(event);
                }
            }
            EventType::Heartbeat => {}
        }
    }

    /// Existing agents only: marks the agent active and bumps `last_seen`.
    fn touch(&mut self, event: &WireEvent) -> Option<&mut AgentActivity> {
        let agent = self.agents.get_mut(&event.agent_id)?;
        agent.status = AgentStatus::Active;
        agent.last_seen = event.timestamp.clone();
        Some(agent)
    }
}

fn started_record(event: &WireEvent) -> AgentActivity {
    let status = event
        .payload_str("status")
        .and_then(|status| status.parse().ok())
        .unwrap_or(AgentStatus::Active);
    let model = event
        .payload_str("model")
        .unwrap_or(UNKNOWN_MODEL)
        .to_string();
    let tools = match event.payload.get("tools") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(ToString::to_string)
            .collect(),
        _ => BTreeSet::new(),
    };
    AgentActivity {
        agent_id: event.agent_id.clone(),
        status,
        model,
        tools,
        tokens: TokenUsage::from_payload(event),
        last_seen: event.timestamp.clone(),
    }
}
