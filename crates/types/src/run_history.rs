//! Durable run-history records and their ordered step sequences.

use crate::error::OrcheoError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Status of a run as recorded by the history store. Terminal states obey
/// the same sealing rule as `WorkflowRunStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunHistoryStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunHistoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunHistoryStatus::Running => "running",
            RunHistoryStatus::Completed => "completed",
            RunHistoryStatus::Failed => "failed",
            RunHistoryStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunHistoryStatus::Running)
    }

    pub fn parse(text: &str) -> Result<Self, OrcheoError> {
        match text {
            "running" => Ok(RunHistoryStatus::Running),
            "completed" => Ok(RunHistoryStatus::Completed),
            "failed" => Ok(RunHistoryStatus::Failed),
            "cancelled" => Ok(RunHistoryStatus::Cancelled),
            other => Err(OrcheoError::Validation(format!(
                "unknown history status '{other}'"
            ))),
        }
    }
}

/// One atomic update emitted by a node during a run. `index` always equals
/// the step's position in the record's sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryStep {
    pub index: i64,
    pub at: DateTime<Utc>,
    pub payload: Value,
}

/// Append-only log of one execution, mirrored next to the repository's
/// authoritative run record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunHistoryRecord {
    pub execution_id: String,
    pub workflow_id: String,
    pub status: RunHistoryStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub inputs: Value,
    pub runnable_config: Option<Value>,
    #[serde(default)]
    pub steps: Vec<RunHistoryStep>,
    pub trace_id: Option<String>,
    pub trace_started_at: Option<DateTime<Utc>>,
    pub trace_completed_at: Option<DateTime<Utc>>,
    pub trace_last_span_at: Option<DateTime<Utc>>,
}

/// Parameters for opening a new history record.
#[derive(Debug, Clone)]
pub struct RunStartRequest {
    pub execution_id: String,
    pub workflow_id: String,
    pub inputs: Value,
    pub runnable_config: Option<Value>,
    pub trace_id: Option<String>,
    pub trace_started_at: Option<DateTime<Utc>>,
}

impl RunStartRequest {
    pub fn new(execution_id: &str, workflow_id: &str, inputs: Value) -> Self {
        RunStartRequest {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            inputs,
            runnable_config: None,
            trace_id: None,
            trace_started_at: None,
        }
    }
}

/// Partial update applied to a record's trace metadata. `None` fields are
/// left untouched.
#[derive(Debug, Clone, Default)]
pub struct TraceMetadataUpdate {
    pub trace_id: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}
