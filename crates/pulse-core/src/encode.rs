use crate::detect::{ChangeEvent, ChangeSet, LifecycleChange};
use crate::snapshot::{AgentState, Snapshot};
use crate::wire::{EventType, WireEvent};
use crate::AgentStatus;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};

/// Maps one detected change onto its wire envelope. `now` is used only when
/// the change carries no timestamp of its own.
pub fn encode(change: ChangeEvent, now: DateTime<Utc>) -> WireEvent {
    let timestamp = change.timestamp().unwrap_or(now);
    match change {
        ChangeEvent::Lifecycle(change) => encode_lifecycle(change, timestamp),
        ChangeEvent::ModelSwitch(change) => WireEvent::new(
            EventType::ModelSwitched,
            change.agent_id,
            timestamp,
            json!({
                "model": change.to,
                "previousModel": change.from,
            }),
        ),
        ChangeEvent::TokenDelta(change) => WireEvent::new(
            EventType::TokenUpdate,
            change.agent_id,
            timestamp,
            json!({
                "input": change.input_tokens,
                "output": change.output_tokens,
                "total": change.total_tokens,
                "delta": change.delta,
            }),
        ),
        ChangeEvent::ToolUsage(change) => WireEvent::new(
            EventType::ToolCalled,
            change.agent_id,
            timestamp,
            json!({ "tool": change.tool }),
        ),
    }
}

pub fn encode_all(changes: ChangeSet, now: DateTime<Utc>) -> Vec<WireEvent> {
    changes
        .into_events()
        .into_iter()
        .map(|change| encode(change, now))
        .collect()
}

/// One `agent_started` per agent that has not ended, used to bring a freshly
/// connected client up to date before it sees live deltas.
pub fn sync_events(snapshot: &Snapshot, now: DateTime<Utc>) -> Vec<WireEvent> {
    snapshot
        .agents
        .values()
        .filter(|state| !state.status.is_ended())
        .map(|state| {
            let mut payload = started_payload(state, None);
            payload["sync"] = Value::Bool(true);
            WireEvent::new(EventType::AgentStarted, state.agent_id.clone(), now, payload)
        })
        .collect()
}

fn encode_lifecycle(change: LifecycleChange, timestamp: DateTime<Utc>) -> WireEvent {
    if change.current_status == AgentStatus::Ended {
        return WireEvent::new(
            EventType::AgentEnded,
            change.agent_id,
            timestamp,
            json!({
                "status": AgentStatus::Ended.as_str(),
                "previousStatus": change.previous_status.map(|status| status.as_str()),
            }),
        );
    }

    let payload = match &change.state {
        Some(state) => started_payload(state, change.previous_status),
        None => json!({
            "status": change.current_status.as_str(),
            "previousStatus": change.previous_status.map(|status| status.as_str()),
        }),
    };
    WireEvent::new(EventType::AgentStarted, change.agent_id, timestamp, payload)
}

fn started_payload(state: &AgentState, previous_status: Option<AgentStatus>) -> Value {
    json!({
        "status": state.status.as_str(),
        "previousStatus": previous_status.map(|status| status.as_str()),
        "model": state.current_model,
        "input": state.input_tokens,
        "output": state.output_tokens,
        "total": state.total_tokens,
        "contextUsagePercent": state.context_usage_percent,
        "tools": state.tools_used.iter().collect::<Vec<_>>(),
        "sessions": state.sessions.len(),
    })
}
