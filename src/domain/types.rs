use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::plan::Plan;

/// Free-form key/value outputs produced by a node.
pub type NodeOutputs = HashMap<String, serde_json::Value>;

/// Current UTC time truncated to microseconds.
///
/// Both backends store timestamps at this precision so a value read back from
/// the durable store compares equal to the one the volatile store keeps.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Succeeded => "succeeded",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(RunStatus::Queued),
            "running" => Ok(RunStatus::Running),
            "succeeded" => Ok(RunStatus::Succeeded),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(format!("unknown run status: {}", other)),
        }
    }
}

/// Status of an individual node within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
    Skipped,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Pending => "pending",
            NodeStatus::Queued => "queued",
            NodeStatus::Running => "running",
            NodeStatus::Succeeded => "succeeded",
            NodeStatus::Failed => "failed",
            NodeStatus::Cancelled => "cancelled",
            NodeStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeStatus::Succeeded | NodeStatus::Failed | NodeStatus::Cancelled | NodeStatus::Skipped
        )
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Iteration progress of a `for_each` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct IterationProgress {
    pub current: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total: Option<u64>,
}

/// Runtime record of one node within one run.
///
/// `seq` is the per-run sequence the state was written at. A write carrying a
/// sequence that is not strictly greater than the stored one is ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<IterationProgress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_branch: Option<String>,
}

impl NodeState {
    /// A fresh `pending` state, as seeded for every plan node at run creation.
    pub fn pending(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            status: NodeStatus::Pending,
            seq: 0,
            started_at: None,
            finished_at: None,
            exit_code: None,
            error: None,
            retries: 0,
            iteration: None,
            selected_branch: None,
        }
    }

    pub fn with_status(mut self, status: NodeStatus, seq: u64) -> Self {
        self.status = status;
        self.seq = seq;
        self
    }

    /// Whether a write at `seq` may replace this state.
    pub fn accepts(&self, seq: u64) -> bool {
        seq > self.seq
    }

    /// Replace this state with a caller-supplied write. Returns `false` and
    /// leaves the state untouched unless the write's `seq` is newer.
    pub fn supersede(&mut self, mut incoming: NodeState) -> bool {
        if !self.accepts(incoming.seq) {
            return false;
        }
        incoming.node_id = std::mem::take(&mut self.node_id);
        *self = incoming;
        true
    }
}

/// Lightweight run snapshot (no plan).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeta {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunMeta {
    /// A freshly created, queued run.
    pub fn queued(id: &str, name: &str) -> Self {
        let now = now_utc();
        Self {
            id: id.to_string(),
            name: name.to_string(),
            status: RunStatus::Queued,
            started_at: None,
            finished_at: None,
            error: None,
            cancelled: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status update. Fails with the current status when the run is
    /// terminal and the update names a different status; repeating the
    /// terminal status changes nothing.
    pub fn apply(&mut self, update: &RunStatusUpdate) -> Result<(), RunStatus> {
        if self.status.is_terminal() {
            return if update.status == self.status {
                Ok(())
            } else {
                Err(self.status)
            };
        }
        self.status = update.status;
        if update.started_at.is_some() {
            self.started_at = update.started_at;
        }
        if update.finished_at.is_some() {
            self.finished_at = update.finished_at;
        }
        if update.error.is_some() {
            self.error = update.error.clone();
        }
        self.updated_at = now_utc();
        Ok(())
    }

    /// Mark the run cancelled. Returns `false` when it had already finished.
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        let now = now_utc();
        self.status = RunStatus::Cancelled;
        self.cancelled = true;
        self.finished_at = Some(now);
        self.updated_at = now;
        true
    }
}

/// Full run snapshot including the plan it executes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    #[serde(flatten)]
    pub meta: RunMeta,
    pub plan: Plan,
}

/// Arguments of a run status update. Timestamps and error are only written
/// when present.
#[derive(Debug, Clone, PartialEq)]
pub struct RunStatusUpdate {
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RunStatusUpdate {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn started_at(mut self, at: DateTime<Utc>) -> Self {
        self.started_at = Some(at.trunc_subsecs(6));
        self
    }

    pub fn finished_at(mut self, at: DateTime<Utc>) -> Self {
        self.finished_at = Some(at.trunc_subsecs(6));
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

impl From<RunStatus> for RunStatusUpdate {
    fn from(status: RunStatus) -> Self {
        Self::new(status)
    }
}
