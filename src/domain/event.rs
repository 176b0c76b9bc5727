use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::domain::types::{IterationProgress, NodeState, NodeStatus, RunStatus};

/// Kind of a run event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    StreamStart,
    StreamEnd,
    StreamData,
    Log,
    Checkpoint,
    NodeStatus,
    RunStatus,
    Progress,
    Error,
    ConditionEvaluated,
    BranchSelected,
    BranchSkipped,
    LoopStarted,
    LoopIteration,
    LoopComplete,
    Hello,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::StreamStart => "stream_start",
            EventType::StreamEnd => "stream_end",
            EventType::StreamData => "stream_data",
            EventType::Log => "log",
            EventType::Checkpoint => "checkpoint",
            EventType::NodeStatus => "node_status",
            EventType::RunStatus => "run_status",
            EventType::Progress => "progress",
            EventType::Error => "error",
            EventType::ConditionEvaluated => "condition_evaluated",
            EventType::BranchSelected => "branch_selected",
            EventType::BranchSkipped => "branch_skipped",
            EventType::LoopStarted => "loop_started",
            EventType::LoopIteration => "loop_iteration",
            EventType::LoopComplete => "loop_complete",
            EventType::Hello => "hello",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown event type: {}", s))
    }
}

/// One immutable, sequence-numbered fact in a run's log.
///
/// The sequence is serialised as the string `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "id", with = "seq_as_string")]
    pub seq: u64,
    pub run_id: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub data: serde_json::Value,
}

impl Event {
    /// The wire id of this event.
    pub fn id(&self) -> String {
        self.seq.to_string()
    }

    /// Decode the payload into a typed struct.
    pub fn payload<T: DeserializeOwned>(&self) -> Option<T> {
        serde_json::from_value(self.data.clone()).ok()
    }

    /// Format as a Server-Sent Events frame.
    pub fn to_sse(&self) -> Result<String, serde_json::Error> {
        let data = serde_json::to_string(self)?;
        Ok(format!(
            "id: {}\nevent: {}\ndata: {}\n\n",
            self.seq, self.event_type, data
        ))
    }

    /// Project this event onto a node's state. Returns whether the state
    /// changed. Events older than the state's sequence are ignored.
    pub fn apply_to(&self, state: &mut NodeState) -> bool {
        if !state.accepts(self.seq) {
            return false;
        }
        match self.event_type {
            EventType::NodeStatus => {
                let Some(payload) = self.payload::<NodeStatusPayload>() else {
                    return false;
                };
                state.status = payload.status;
                if payload.status == NodeStatus::Running && state.started_at.is_none() {
                    state.started_at = Some(self.timestamp);
                }
                if payload.status.is_terminal() {
                    state.finished_at = Some(self.timestamp);
                }
                if payload.exit_code.is_some() {
                    state.exit_code = payload.exit_code;
                }
                if payload.error.is_some() {
                    state.error = payload.error;
                }
            }
            EventType::LoopStarted => {
                let Some(payload) = self.payload::<LoopStartedPayload>() else {
                    return false;
                };
                state.iteration = Some(IterationProgress {
                    current: 0,
                    total: payload.total,
                });
            }
            EventType::LoopIteration => {
                let Some(payload) = self.payload::<LoopIterationPayload>() else {
                    return false;
                };
                let progress = state.iteration.get_or_insert_with(Default::default);
                progress.current = payload.index;
                if payload.total.is_some() {
                    progress.total = payload.total;
                }
            }
            EventType::ConditionEvaluated => {
                match self.payload::<ConditionEvaluatedPayload>() {
                    Some(ConditionEvaluatedPayload {
                        selected_branch: Some(branch),
                        ..
                    }) => state.selected_branch = Some(branch),
                    _ => return false,
                }
            }
            EventType::BranchSelected => {
                let Some(payload) = self.payload::<BranchPayload>() else {
                    return false;
                };
                state.selected_branch = Some(payload.branch);
            }
            _ => return false,
        }
        state.seq = self.seq;
        true
    }

    /// Whether this event carries state that [`Event::apply_to`] projects.
    pub fn is_projected(&self) -> bool {
        self.node_id.is_some()
            && matches!(
                self.event_type,
                EventType::NodeStatus
                    | EventType::LoopStarted
                    | EventType::LoopIteration
                    | EventType::ConditionEvaluated
                    | EventType::BranchSelected
            )
    }
}

mod seq_as_string {
    use super::*;

    pub fn serialize<S: Serializer>(seq: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(seq)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Input to `append_event`: the store allocates id and timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventInput {
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl EventInput {
    pub fn new(event_type: EventType, data: serde_json::Value) -> Self {
        Self {
            event_type,
            node_id: None,
            data,
        }
    }

    /// Build an input from a typed payload.
    pub fn with_payload<T: Serialize>(
        event_type: EventType,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_value(payload)?))
    }

    pub fn for_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn node_status(node_id: &str, status: NodeStatus) -> Self {
        Self::new(
            EventType::NodeStatus,
            serde_json::json!({ "status": status }),
        )
        .for_node(node_id)
    }

    pub fn run_status(status: RunStatus) -> Self {
        Self::new(EventType::RunStatus, serde_json::json!({ "status": status }))
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        Self::new(
            EventType::Log,
            serde_json::json!({ "level": level, "message": message.into() }),
        )
    }

    /// Parse one NDJSON line emitted by an agent. The `type` field selects the
    /// event type (default `log`); the whole object becomes the payload.
    pub fn from_ndjson(line: &str) -> Result<Self, serde_json::Error> {
        let raw: serde_json::Map<String, serde_json::Value> = serde_json::from_str(line)?;
        let event_type = raw
            .get("type")
            .and_then(|t| t.as_str())
            .and_then(|t| t.parse().ok())
            .unwrap_or(EventType::Log);
        let node_id = raw
            .get("node_id")
            .and_then(|n| n.as_str())
            .map(String::from);
        Ok(Self {
            event_type,
            node_id,
            data: serde_json::Value::Object(raw),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogPayload {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<std::collections::BTreeMap<String, String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointPayload {
    pub label: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatusPayload {
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatusPayload {
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressPayload {
    pub current: u64,
    pub total: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamDataPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopStartedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopIterationPayload {
    pub index: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConditionEvaluatedPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

/// Payload of `branch_selected` / `branch_skipped`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchPayload {
    pub branch: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
}
