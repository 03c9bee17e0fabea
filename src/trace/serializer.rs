//! Serialize stored history steps into paginated trace responses and
//! incremental websocket update payloads.

use crate::trace::attributes::{
    span_name_for_step, span_status_from_text, step_attributes, step_status, token_usage_totals,
    truncate_text,
};
use crate::trace::{
    root_span_id, step_span_id, TraceExecutionSummary, TracePageInfo, TraceResponse, TraceSpan,
    TraceSpanEvent, TraceSpanStatus, TraceTokenUsage, TraceUpdateMessage, ROOT_SPAN_NAME,
};
use chrono::{DateTime, Utc};
use orcheo_types::{RunHistoryRecord, RunHistoryStep};
use serde_json::{json, Map, Value};

const TRACE_UPDATE_TYPE: &str = "trace:update";
const TOKEN_EVENT_THRESHOLD: i64 = 1000;

/// Everything needed to shape a root span outside a stored record.
#[derive(Debug, Clone)]
pub struct RootSpanContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub trace_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: String,
    pub error: Option<String>,
    pub inputs: Option<Value>,
}

impl RootSpanContext {
    pub fn from_record(record: &RunHistoryRecord) -> Self {
        RootSpanContext {
            execution_id: record.execution_id.clone(),
            workflow_id: record.workflow_id.clone(),
            trace_id: record.trace_id.clone(),
            started_at: record.trace_started_at.unwrap_or(record.started_at),
            completed_at: record.trace_completed_at.or(record.completed_at),
            status: record.status.as_str().to_string(),
            error: record.error.clone(),
            inputs: Some(record.inputs.clone()),
        }
    }
}

fn build_root_span(context: &RootSpanContext) -> TraceSpan {
    let mut attributes = Map::new();
    attributes.insert(
        "orcheo.workflow.id".to_string(),
        json!(context.workflow_id),
    );
    attributes.insert(
        "orcheo.execution.id".to_string(),
        json!(context.execution_id),
    );
    attributes.insert("orcheo.execution.status".to_string(), json!(context.status));
    if let Some(inputs) = &context.inputs {
        if !inputs.is_null() {
            let serialized =
                serde_json::to_string(inputs).unwrap_or_else(|_| "<unserializable>".to_string());
            attributes.insert(
                "orcheo.workflow.inputs".to_string(),
                json!(truncate_text(&serialized)),
            );
        }
    }
    TraceSpan {
        span_id: root_span_id(&context.execution_id),
        parent_span_id: None,
        name: ROOT_SPAN_NAME.to_string(),
        start_time: context.started_at,
        end_time: context.completed_at,
        attributes,
        events: Vec::new(),
        status: span_status_from_text(&context.status, context.error.as_deref()),
    }
}

fn text_events(name: &str, value: &Value, at: DateTime<Utc>) -> Vec<TraceSpanEvent> {
    let mut events = Vec::new();
    match value {
        Value::Array(items) => {
            for item in items {
                events.extend(text_events(name, item, at));
            }
        }
        Value::Object(map) => {
            let preview = map
                .get("content")
                .and_then(Value::as_str)
                .map(truncate_text);
            if let Some(preview) = preview {
                let mut attributes = Map::new();
                attributes.insert(
                    "role".to_string(),
                    map.get("role").cloned().unwrap_or_else(|| json!("message")),
                );
                attributes.insert("preview".to_string(), json!(preview));
                events.push(TraceSpanEvent {
                    name: name.to_string(),
                    time: at,
                    attributes,
                });
            }
        }
        Value::String(text) => {
            let mut attributes = Map::new();
            attributes.insert("preview".to_string(), json!(truncate_text(text)));
            events.push(TraceSpanEvent {
                name: name.to_string(),
                time: at,
                attributes,
            });
        }
        _ => {}
    }
    events
}

fn step_events(payload: &Value, at: DateTime<Utc>) -> Vec<TraceSpanEvent> {
    let mut events = Vec::new();
    let node_payloads: Vec<&Value> = match payload.as_object() {
        Some(map) => map.values().collect(),
        None => return events,
    };
    for node_payload in node_payloads {
        let Some(map) = node_payload.as_object() else {
            continue;
        };
        for key in ["prompt", "prompts"] {
            if let Some(value) = map.get(key) {
                events.extend(text_events("prompt", value, at));
            }
        }
        for key in ["response", "responses"] {
            if let Some(value) = map.get(key) {
                events.extend(text_events("response", value, at));
            }
        }
        if let Some(messages) = map.get("messages") {
            events.extend(text_events("message", messages, at));
        }
        if let Some(Value::String(error)) = map.get("error") {
            let mut attributes = Map::new();
            attributes.insert("message".to_string(), json!(truncate_text(error)));
            events.push(TraceSpanEvent {
                name: "error.detail".to_string(),
                time: at,
                attributes,
            });
        }
    }
    let (input_tokens, output_tokens) = token_usage_totals(payload);
    if input_tokens > TOKEN_EVENT_THRESHOLD || output_tokens > TOKEN_EVENT_THRESHOLD {
        let mut attributes = Map::new();
        attributes.insert("input".to_string(), json!(input_tokens));
        attributes.insert("output".to_string(), json!(output_tokens));
        attributes.insert("reason".to_string(), json!("high_usage"));
        events.push(TraceSpanEvent {
            name: "token.chunk".to_string(),
            time: at,
            attributes,
        });
    }
    events
}

/// Build the child span for one history step.
pub fn spans_for_step(execution_id: &str, step: &RunHistoryStep) -> Vec<TraceSpan> {
    if !step.payload.is_object() {
        return Vec::new();
    }
    let status = match step_status(&step.payload) {
        Some(status) => {
            let error = step
                .payload
                .get("error")
                .and_then(Value::as_str)
                .or_else(|| step.payload.get("reason").and_then(Value::as_str));
            span_status_from_text(&status, error)
        }
        None => TraceSpanStatus::unset(),
    };
    vec![TraceSpan {
        span_id: step_span_id(execution_id, step.index),
        parent_span_id: Some(root_span_id(execution_id)),
        name: span_name_for_step(&step.payload, step.index),
        start_time: step.at,
        end_time: Some(step.at),
        attributes: step_attributes(&step.payload),
        events: step_events(&step.payload, step.at),
        status,
    }]
}

fn sort_spans(spans: &mut [TraceSpan]) {
    spans.sort_by(|a, b| {
        (a.start_time, a.span_id.as_str()).cmp(&(b.start_time, b.span_id.as_str()))
    });
}

fn aggregate_usage(steps: &[RunHistoryStep]) -> TraceTokenUsage {
    let mut usage = TraceTokenUsage::default();
    for step in steps {
        let (input, output) = token_usage_totals(&step.payload);
        usage.input += input;
        usage.output += output;
    }
    usage
}

/// Paginated trace response over a stored record. The root span is only
/// emitted on the first page; token usage aggregates across all steps.
pub fn trace_response(
    record: &RunHistoryRecord,
    cursor: i64,
    limit: Option<i64>,
) -> TraceResponse {
    let start = cursor.max(0) as usize;
    let window: Vec<&RunHistoryStep> = match limit {
        Some(limit) => record.steps.iter().skip(start).take(limit.max(0) as usize).collect(),
        None => record.steps.iter().skip(start).collect(),
    };

    let mut spans = Vec::new();
    if start == 0 {
        spans.push(build_root_span(&RootSpanContext::from_record(record)));
    }
    for step in &window {
        spans.extend(spans_for_step(&record.execution_id, step));
    }
    sort_spans(&mut spans);

    let next_cursor = start + window.len();
    let has_next = next_cursor < record.steps.len();
    let usage = aggregate_usage(&record.steps);
    let token_usage = if usage.input != 0 || usage.output != 0 {
        Some(usage)
    } else {
        None
    };

    TraceResponse {
        execution: TraceExecutionSummary {
            id: record.execution_id.clone(),
            workflow_id: record.workflow_id.clone(),
            status: record.status.as_str().to_string(),
            started_at: record.trace_started_at.unwrap_or(record.started_at),
            finished_at: record.trace_completed_at.or(record.completed_at),
            trace_id: record.trace_id.clone(),
            token_usage,
        },
        spans,
        page_info: TracePageInfo {
            has_next_page: has_next,
            cursor: Some(next_cursor as i64),
        },
    }
}

/// Inputs for an incremental websocket update.
#[derive(Debug, Clone)]
pub struct TraceUpdateArgs<'a> {
    pub root: Option<&'a RootSpanContext>,
    pub steps: &'a [RunHistoryStep],
    pub complete: bool,
    pub cursor: Option<i64>,
}

/// Build the websocket-shaped incremental payload. Returns `None` when
/// there is nothing to report.
pub fn trace_update_message(
    execution_id: &str,
    trace_id: Option<&str>,
    args: TraceUpdateArgs<'_>,
) -> Option<TraceUpdateMessage> {
    let mut spans = Vec::new();
    if let Some(root) = args.root {
        spans.push(build_root_span(root));
    }
    for step in args.steps {
        spans.extend(spans_for_step(execution_id, step));
    }
    if spans.is_empty() && !args.complete {
        return None;
    }
    sort_spans(&mut spans);

    let cursor = args.cursor.unwrap_or_else(|| {
        args.steps
            .last()
            .map(|step| step.index + 1)
            .unwrap_or(args.steps.len() as i64)
    });

    Some(TraceUpdateMessage {
        message_type: TRACE_UPDATE_TYPE.to_string(),
        execution_id: execution_id.to_string(),
        trace_id: trace_id.map(str::to_string),
        spans,
        complete: args.complete,
        cursor,
    })
}

/// Final websocket payload describing the terminal trace state.
pub fn trace_completion_message(record: &RunHistoryRecord) -> Option<TraceUpdateMessage> {
    let root = RootSpanContext::from_record(record);
    trace_update_message(
        &record.execution_id,
        record.trace_id.as_deref(),
        TraceUpdateArgs {
            root: Some(&root),
            steps: &[],
            complete: true,
            cursor: Some(record.steps.len() as i64),
        },
    )
}
