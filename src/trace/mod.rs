//! Per-run observability: the domain span model plus the serializer
//! that turns stored history steps into paginated responses and
//! incremental websocket deltas. Export to a telemetry backend is owned
//! by the transport layer.

mod attributes;
mod serializer;

pub use attributes::{
    span_name_for_step, span_status_from_text, step_attributes, step_status, truncate_text,
    MAX_ATTRIBUTE_CHARS, MAX_SEQUENCE_ITEMS,
};
pub use serializer::{
    spans_for_step, trace_completion_message, trace_response, trace_update_message,
    RootSpanContext, TraceUpdateArgs,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Root span name for every workflow execution.
pub const ROOT_SPAN_NAME: &str = "workflow.execution";

/// Span status code mirroring the OTLP status model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanStatusCode {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
    #[serde(rename = "UNSET")]
    Unset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpanStatus {
    pub code: SpanStatusCode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl TraceSpanStatus {
    pub fn ok() -> Self {
        TraceSpanStatus {
            code: SpanStatusCode::Ok,
            message: None,
        }
    }

    pub fn error(message: Option<String>) -> Self {
        TraceSpanStatus {
            code: SpanStatusCode::Error,
            message,
        }
    }

    pub fn unset() -> Self {
        TraceSpanStatus {
            code: SpanStatusCode::Unset,
            message: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpanEvent {
    pub name: String,
    pub time: DateTime<Utc>,
    pub attributes: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSpan {
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub attributes: Map<String, Value>,
    pub events: Vec<TraceSpanEvent>,
    pub status: TraceSpanStatus,
}

/// Websocket-shaped incremental trace payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceUpdateMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    pub execution_id: String,
    pub trace_id: Option<String>,
    pub spans: Vec<TraceSpan>,
    pub complete: bool,
    pub cursor: i64,
}

/// Aggregated token counters across a record's steps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TraceTokenUsage {
    pub input: i64,
    pub output: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceExecutionSummary {
    pub id: String,
    pub workflow_id: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TraceTokenUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracePageInfo {
    pub has_next_page: bool,
    pub cursor: Option<i64>,
}

/// Paginated trace view over a stored history record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceResponse {
    pub execution: TraceExecutionSummary,
    pub spans: Vec<TraceSpan>,
    pub page_info: TracePageInfo,
}

pub(crate) fn root_span_id(execution_id: &str) -> String {
    format!("{execution_id}:root")
}

pub(crate) fn step_span_id(execution_id: &str, index: i64) -> String {
    format!("{execution_id}:{index}")
}
