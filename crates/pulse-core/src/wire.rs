use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

/// `agentId` carried by events that are not about a particular agent.
pub const SYSTEM_AGENT_ID: &str = "system";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    AgentStarted,
    AgentEnded,
    ToolCalled,
    ModelSwitched,
    TokenUpdate,
    Heartbeat,
}

impl EventType {
    pub const ALL: [EventType; 6] = [
        EventType::AgentStarted,
        EventType::AgentEnded,
        EventType::ToolCalled,
        EventType::ModelSwitched,
        EventType::TokenUpdate,
        EventType::Heartbeat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::AgentStarted => "agent_started",
            EventType::AgentEnded => "agent_ended",
            EventType::ToolCalled => "tool_called",
            EventType::ModelSwitched => "model_switched",
            EventType::TokenUpdate => "token_update",
            EventType::Heartbeat => "heartbeat",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The envelope every client receives, one per text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent {
    pub timestamp: String,
    pub agent_id: String,
    pub event_type: EventType,
    pub payload: Map<String, Value>,
}

impl WireEvent {
    pub fn new(
        event_type: EventType,
        agent_id: impl Into<String>,
        timestamp: DateTime<Utc>,
        payload: Value,
    ) -> Self {
        Self {
            timestamp: format_timestamp(timestamp),
            agent_id: agent_id.into(),
            event_type,
            payload: into_object(payload),
        }
    }

    pub fn heartbeat(timestamp: DateTime<Utc>, payload: Value) -> Self {
        Self::new(EventType::Heartbeat, SYSTEM_AGENT_ID, timestamp, payload)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn payload_u64(&self, key: &str) -> Option<u64> {
        self.payload.get(key).and_then(Value::as_u64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame(event: &WireEvent, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(event).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

/// Parses and validates one inbound frame. Anything without a string
/// `timestamp`, a string `agentId`, a known `eventType` and an object
/// `payload` is rejected.
pub fn decode_frame(text: &str, max_frame_bytes: usize) -> Result<WireEvent, FrameError> {
    let raw = text.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn into_object(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        Value::Null => Map::new(),
        other => {
            let mut map = Map::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn stamp() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn envelope_uses_camel_case_keys_and_snake_case_types() {
        let event = WireEvent::new(
            EventType::ToolCalled,
            "alpha",
            stamp(),
            json!({"tool": "bash"}),
        );
        let text = encode_frame(&event, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&text).expect("json");
        assert_eq!(value["timestamp"], "2026-03-01T12:00:00.000Z");
        assert_eq!(value["agentId"], "alpha");
        assert_eq!(value["eventType"], "tool_called");
        assert_eq!(value["payload"]["tool"], "bash");
    }

    #[test]
    fn decode_accepts_every_known_event_type() {
        for event_type in EventType::ALL {
            let text = format!(
                r#"{{"timestamp":"2026-03-01T12:00:00Z","agentId":"alpha","eventType":"{}","payload":{{}}}}"#,
                event_type.as_str()
            );
            let event = decode_frame(&text, DEFAULT_MAX_FRAME_BYTES).expect("decode");
            assert_eq!(event.event_type, event_type);
        }
    }

    #[test]
    fn decode_rejects_malformed_envelopes() {
        let cases = [
            r#"{"timestamp":"t","eventType":"heartbeat","payload":{}}"#,
            r#"{"timestamp":12,"agentId":"a","eventType":"heartbeat","payload":{}}"#,
            r#"{"timestamp":"t","agentId":7,"eventType":"heartbeat","payload":{}}"#,
            r#"{"timestamp":"t","agentId":"a","eventType":"agent_paused","payload":{}}"#,
            r#"{"timestamp":"t","agentId":"a","eventType":"heartbeat","payload":[1,2]}"#,
            r#"{"timestamp":"t","agentId":"a","eventType":"heartbeat"}"#,
            "not json",
        ];
        for case in cases {
            let result = decode_frame(case, DEFAULT_MAX_FRAME_BYTES);
            assert!(matches!(result, Err(FrameError::Decode(_))), "accepted {case}");
        }
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let event = WireEvent::new(
            EventType::Heartbeat,
            SYSTEM_AGENT_ID,
            stamp(),
            json!({"blob": "x".repeat(256)}),
        );
        assert!(matches!(
            encode_frame(&event, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
        let text = encode_frame(&event, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        assert!(matches!(
            decode_frame(&text, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
    }

    #[test]
    fn non_object_payloads_are_wrapped() {
        let event = WireEvent::new(EventType::Heartbeat, SYSTEM_AGENT_ID, stamp(), json!(3));
        assert_eq!(event.payload_u64("value"), Some(3));
        let empty = WireEvent::heartbeat(stamp(), Value::Null);
        assert!(empty.payload.is_empty());
        assert_eq!(empty.agent_id, SYSTEM_AGENT_ID);
    }
}
