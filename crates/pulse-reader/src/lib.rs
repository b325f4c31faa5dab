//! Reconstructs agent state from the on-disk session layout:
//!
//! ```text
//! <root>/<agent-id>/sessions/sessions.json
//! <root>/<agent-id>/sessions/<session-id>.jsonl
//! ```

use chrono::{DateTime, TimeZone, Utc};
use pulse_core::{
    classify_status, is_known_model, AgentState, SessionSummary, Snapshot, SnapshotError,
    SnapshotSource, UNKNOWN_MODEL,
};
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SESSIONS_DIR: &str = "sessions";
pub const INDEX_FILE: &str = "sessions.json";
pub const TRANSCRIPT_EXTENSION: &str = "jsonl";

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIndexEntry {
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    updated_at: Option<Value>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
    #[serde(default)]
    context_tokens: Option<u64>,
    #[serde(default)]
    context_window: Option<u64>,
}

#[derive(Debug, Default)]
struct TranscriptSummary {
    modified: Option<DateTime<Utc>>,
    model: Option<String>,
    tools: BTreeSet<String>,
    skipped_corrupt_lines: usize,
}

struct SessionRecord {
    summary: SessionSummary,
    last_update: Option<DateTime<Utc>>,
    input_tokens: u64,
    output_tokens: u64,
    context_percent: Option<f64>,
    tools: BTreeSet<String>,
}

#[derive(Debug, Clone)]
pub struct SessionDirReader {
    root: PathBuf,
}

impl SessionDirReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Reads every agent under the root. An agent whose files cannot be read
    /// is left out of the snapshot; only an unreadable root is an error.
    pub fn take_snapshot_at(&self, now: DateTime<Utc>) -> Result<Snapshot, SnapshotError> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Snapshot::empty(now));
            }
            Err(source) => {
                return Err(SnapshotError::Io {
                    path: self.root.clone(),
                    source,
                });
            }
        };

        let mut agents = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(event = "agent_dir_entry_error", error = %err);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let Some(agent_id) = path
                .file_name()
                .and_then(|name| name.to_str())
                .filter(|name| !name.starts_with('.'))
                .map(ToString::to_string)
            else {
                continue;
            };

            match read_agent(&agent_id, &path, now) {
                Ok(Some(state)) => agents.push(state),
                Ok(None) => {}
                Err(err) => {
                    debug!(event = "agent_read_skipped", agent_id = %agent_id, error = %err);
                }
            }
        }

        Ok(Snapshot::from_agents(now, agents))
    }
}

impl SnapshotSource for SessionDirReader {
    fn take_snapshot(&self) -> Result<Snapshot, SnapshotError> {
        self.take_snapshot_at(Utc::now())
    }
}

fn read_agent(
    agent_id: &str,
    agent_dir: &Path,
    now: DateTime<Utc>,
) -> Result<Option<AgentState>, SnapshotError> {
    let sessions_dir = agent_dir.join(SESSIONS_DIR);
    let index_path = sessions_dir.join(INDEX_FILE);
    let bytes = match fs::read(&index_path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SnapshotError::Io {
                path: index_path,
                source,
            })
        }
    };
    let index: Value = serde_json::from_slice(&bytes).map_err(|err| SnapshotError::Malformed {
        path: index_path.clone(),
        message: err.to_string(),
    })?;
    let Value::Object(index) = index else {
        return Err(SnapshotError::Malformed {
            path: index_path,
            message: "session index is not an object".to_string(),
        });
    };

    let mut records = Vec::with_capacity(index.len());
    for (key, raw) in index {
        let entry: SessionIndexEntry = match serde_json::from_value(raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(event = "session_entry_skipped", agent_id, key = %key, error = %err);
                continue;
            }
        };
        records.push(read_session(&sessions_dir, key, entry)?);
    }

    let has_live_session_records = records.iter().any(|record| record.summary.live);
    let last_update = match records.iter().filter_map(|record| record.last_update).max() {
        Some(value) => value,
        None => modified_at(&index_path)?,
    };

    // Most recently updated first; undated sessions sink to the end.
    records.sort_by(|a, b| {
        b.last_update
            .cmp(&a.last_update)
            .then_with(|| a.summary.key.cmp(&b.summary.key))
    });

    let mut state = AgentState::new(
        agent_id,
        classify_status(now, last_update, has_live_session_records),
        last_update,
    );
    state.current_model = records
        .iter()
        .find_map(|record| record.summary.model.clone())
        .unwrap_or_else(|| UNKNOWN_MODEL.to_string());
    state.context_usage_percent = records
        .first()
        .and_then(|record| record.context_percent)
        .unwrap_or(0.0);
    for record in records {
        state.input_tokens = state.input_tokens.saturating_add(record.input_tokens);
        state.output_tokens = state.output_tokens.saturating_add(record.output_tokens);
        state.total_tokens = state.total_tokens.saturating_add(record.summary.total_tokens);
        state.tools_used.extend(record.tools);
        state.sessions.push(record.summary);
    }

    Ok(Some(state))
}

fn read_session(
    sessions_dir: &Path,
    key: String,
    entry: SessionIndexEntry,
) -> Result<SessionRecord, SnapshotError> {
    let session_id = entry
        .session_id
        .clone()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| key.clone());
    let transcript_path = sessions_dir.join(format!("{session_id}.{TRANSCRIPT_EXTENSION}"));
    let transcript = read_transcript(&transcript_path)?;

    let updated_at = entry.updated_at.as_ref().and_then(parse_timestamp_value);
    let last_update = updated_at.max(transcript.as_ref().and_then(|t| t.modified));
    let model = entry
        .model
        .clone()
        .filter(|model| is_known_model(model))
        .or_else(|| transcript.as_ref().and_then(|t| t.model.clone()));

    let input_tokens = entry.input_tokens.unwrap_or(0);
    let output_tokens = entry.output_tokens.unwrap_or(0);
    let total_tokens = entry
        .total_tokens
        .unwrap_or_else(|| input_tokens.saturating_add(output_tokens));
    let context_percent = match (entry.context_tokens, entry.context_window) {
        (Some(used), Some(window)) if window > 0 => Some(used as f64 / window as f64 * 100.0),
        _ => None,
    };

    let live = transcript.is_some();
    let tools = transcript.map(|t| t.tools).unwrap_or_default();

    Ok(SessionRecord {
        summary: SessionSummary {
            session_id,
            key,
            model,
            total_tokens,
            updated_at: last_update,
            live,
        },
        last_update,
        input_tokens,
        output_tokens,
        context_percent,
        tools,
    })
}

fn read_transcript(path: &Path) -> Result<Option<TranscriptSummary>, SnapshotError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SnapshotError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    let mut summary = TranscriptSummary {
        modified: modified_at(path).ok(),
        ..TranscriptSummary::default()
    };
    for line in bytes.split(|byte| *byte == b'\n') {
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let record: Value = match serde_json::from_slice(line) {
            Ok(record) => record,
            Err(_) => {
                summary.skipped_corrupt_lines += 1;
                continue;
            }
        };
        collect_tool_names(&record, &mut summary.tools);
        if let Some(model) = record_model(&record) {
            summary.model = Some(model);
        }
    }

    if summary.skipped_corrupt_lines > 0 {
        debug!(
            event = "transcript_corrupt_lines",
            path = %path.display(),
            skipped = summary.skipped_corrupt_lines
        );
    }
    Ok(Some(summary))
}

fn collect_tool_names(record: &Value, tools: &mut BTreeSet<String>) {
    for key in ["tool_name", "tool"] {
        if let Some(name) = record.get(key).and_then(Value::as_str) {
            insert_tool(tools, name);
        }
    }

    let content = record
        .get("message")
        .and_then(|message| message.get("content"))
        .or_else(|| record.get("content"))
        .and_then(Value::as_array);
    let Some(items) = content else {
        return;
    };
    for item in items {
        let is_tool_call = matches!(
            item.get("type").and_then(Value::as_str),
            Some("toolCall" | "tool_use" | "tool_call")
        );
        if !is_tool_call {
            continue;
        }
        if let Some(name) = item.get("name").and_then(Value::as_str) {
            insert_tool(tools, name);
        }
    }
}

fn insert_tool(tools: &mut BTreeSet<String>, name: &str) {
    let name = name.trim();
    if !name.is_empty() {
        tools.insert(name.to_string());
    }
}

fn record_model(record: &Value) -> Option<String> {
    let declared = if record.get("type").and_then(Value::as_str) == Some("model_change") {
        record.get("modelId").or_else(|| record.get("model"))
    } else {
        record.get("message").and_then(|message| message.get("model"))
    };
    declared
        .and_then(Value::as_str)
        .filter(|model| is_known_model(model))
        .map(ToString::to_string)
}

fn parse_timestamp_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(number) => number
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::String(raw) => {
            let raw = raw.trim();
            if let Ok(millis) = raw.parse::<i64>() {
                return Utc.timestamp_millis_opt(millis).single();
            }
            DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|value| value.with_timezone(&Utc))
        }
        _ => None,
    }
}

fn modified_at(path: &Path) -> Result<DateTime<Utc>, SnapshotError> {
    fs::metadata(path)
        .and_then(|metadata| metadata.modified())
        .map(DateTime::<Utc>::from)
        .map_err(|source| SnapshotError::Io {
            path: path.to_path_buf(),
            source,
        })
}
