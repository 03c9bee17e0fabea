//! Span attribute extraction from step payloads, with hard truncation
//! limits so traces never bloat.

use crate::trace::{SpanStatusCode, TraceSpanStatus};
use serde_json::{json, Map, Number, Value};

/// Attribute strings are capped at this many characters.
pub const MAX_ATTRIBUTE_CHARS: usize = 2048;
/// Sequence attributes keep at most this many items plus a sentinel.
pub const MAX_SEQUENCE_ITEMS: usize = 25;

const PROMPT_KEYS: &[&str] = &["prompt", "prompts", "messages"];
const RESPONSE_KEYS: &[&str] = &["response", "responses", "output", "outputs", "result", "results"];
const ARTIFACT_KEYS: &[&str] = &["artifact_ids", "artifacts"];
const TOKEN_KEYS: &[&str] = &["token_usage", "usage"];

/// Truncate a string to the attribute limit, appending an ellipsis
/// sentinel when cut.
pub fn truncate_text(text: &str) -> String {
    if text.chars().count() <= MAX_ATTRIBUTE_CHARS {
        return text.to_string();
    }
    let truncated: String = text.chars().take(MAX_ATTRIBUTE_CHARS).collect();
    format!("{truncated}…")
}

fn truncate_sequence(items: Vec<Value>) -> Vec<Value> {
    if items.len() <= MAX_SEQUENCE_ITEMS {
        return items;
    }
    let hidden = items.len() - MAX_SEQUENCE_ITEMS;
    let mut truncated: Vec<Value> = items.into_iter().take(MAX_SEQUENCE_ITEMS).collect();
    truncated.push(Value::String(format!("...(+{hidden} more)")));
    truncated
}

/// Normalise an arbitrary value into an attribute-safe value.
fn attribute_value(value: &Value) -> Value {
    match value {
        Value::String(text) => Value::String(truncate_text(text)),
        Value::Array(items) => Value::Array(truncate_sequence(
            items.iter().map(attribute_value).collect(),
        )),
        Value::Object(_) => {
            let serialized =
                serde_json::to_string(value).unwrap_or_else(|_| "<unserializable>".to_string());
            Value::String(truncate_text(&serialized))
        }
        other => other.clone(),
    }
}

/// Child span name: `workflow.step.<node_id>` when the payload has a
/// single top-level key, else `workflow.step.<index>`.
pub fn span_name_for_step(payload: &Value, index: i64) -> String {
    if let Some(map) = payload.as_object() {
        if map.len() == 1 {
            if let Some(node_id) = map.keys().next() {
                return format!("workflow.step.{node_id}");
            }
        }
    }
    format!("workflow.step.{index}")
}

/// Pull the status string out of a step payload: the top-level `status`,
/// or the single node payload's `status`.
pub fn step_status(payload: &Value) -> Option<String> {
    let map = payload.as_object()?;
    if let Some(Value::String(status)) = map.get("status") {
        return Some(status.clone());
    }
    if map.len() == 1 {
        if let Some(Value::Object(node_payload)) = map.values().next() {
            if let Some(Value::String(status)) = node_payload.get("status") {
                return Some(status.clone());
            }
        }
    }
    None
}

/// Map a status string onto a span status.
pub fn span_status_from_text(status: &str, message: Option<&str>) -> TraceSpanStatus {
    match status.to_lowercase().as_str() {
        "completed" | "success" | "succeeded" => TraceSpanStatus::ok(),
        "error" | "failed" | "failure" => TraceSpanStatus::error(message.map(str::to_string)),
        "cancelled" | "canceled" => TraceSpanStatus::error(Some(
            message.map(str::to_string).unwrap_or_else(|| "cancelled".to_string()),
        )),
        "running" | "" => TraceSpanStatus::unset(),
        _ => TraceSpanStatus {
            code: SpanStatusCode::Unset,
            message: message.map(str::to_string),
        },
    }
}

fn collect_texts(value: &Value, into: &mut Vec<Value>) {
    match value {
        Value::String(text) => into.push(Value::String(truncate_text(text))),
        Value::Array(items) => {
            for item in items {
                collect_texts(item, into);
            }
        }
        Value::Object(map) => {
            if let Some(Value::String(content)) = map.get("content") {
                into.push(Value::String(truncate_text(content)));
            }
        }
        _ => {}
    }
}

fn collect_under_keys(value: &Value, keys: &[&str], into: &mut Vec<Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if keys.contains(&key.as_str()) {
                    collect_texts(child, into);
                } else {
                    collect_under_keys(child, keys, into);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_under_keys(item, keys, into);
            }
        }
        _ => {}
    }
}

fn collect_artifacts(value: &Value, into: &mut Vec<Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if ARTIFACT_KEYS.contains(&key.as_str()) {
                    if let Value::Array(items) = child {
                        for item in items {
                            match item {
                                Value::Object(artifact) => {
                                    if let Some(id) = artifact.get("id") {
                                        into.push(attribute_value(id));
                                    }
                                }
                                other => into.push(attribute_value(other)),
                            }
                        }
                    }
                } else {
                    collect_artifacts(child, into);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_artifacts(item, into);
            }
        }
        _ => {}
    }
}

fn collect_token_usage(value: &Value, into: &mut Map<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if TOKEN_KEYS.contains(&key.as_str()) {
                    if let Value::Object(usage) = child {
                        for (metric, amount) in usage {
                            let Some(amount) = amount.as_i64() else {
                                continue;
                            };
                            let slot = into
                                .entry(metric.clone())
                                .or_insert_with(|| Value::Number(Number::from(0)));
                            let total = slot.as_i64().unwrap_or(0) + amount;
                            *slot = Value::Number(Number::from(total));
                        }
                    }
                } else {
                    collect_token_usage(child, into);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_token_usage(item, into);
            }
        }
        _ => {}
    }
}

/// Extract the `orcheo.step.*` attribute set from a step payload.
pub fn step_attributes(payload: &Value) -> Map<String, Value> {
    let mut attributes = Map::new();
    if let Some(map) = payload.as_object() {
        let nodes: Vec<Value> = map.keys().cloned().map(Value::String).collect();
        attributes.insert(
            "orcheo.step.nodes".to_string(),
            Value::Array(truncate_sequence(nodes)),
        );
    }

    let mut prompts = Vec::new();
    collect_under_keys(payload, PROMPT_KEYS, &mut prompts);
    if !prompts.is_empty() {
        attributes.insert(
            "orcheo.step.prompts".to_string(),
            Value::Array(truncate_sequence(prompts)),
        );
    }

    let mut responses = Vec::new();
    collect_under_keys(payload, RESPONSE_KEYS, &mut responses);
    if !responses.is_empty() {
        attributes.insert(
            "orcheo.step.responses".to_string(),
            Value::Array(truncate_sequence(responses)),
        );
    }

    let mut artifacts = Vec::new();
    collect_artifacts(payload, &mut artifacts);
    if !artifacts.is_empty() {
        attributes.insert(
            "orcheo.step.artifacts".to_string(),
            Value::Array(truncate_sequence(artifacts)),
        );
    }

    let mut usage = Map::new();
    collect_token_usage(payload, &mut usage);
    for (metric, amount) in usage {
        attributes.insert(format!("orcheo.step.token_usage.{metric}"), amount);
    }

    if let Some(status) = step_status(payload) {
        attributes.insert("orcheo.step.status".to_string(), json!(status));
    }
    attributes
}

/// Extract `(input, output)` token totals from a step payload.
pub(crate) fn token_usage_totals(payload: &Value) -> (i64, i64) {
    let mut usage = Map::new();
    collect_token_usage(payload, &mut usage);
    let input = usage.get("input").and_then(Value::as_i64).unwrap_or(0);
    let output = usage.get("output").and_then(Value::as_i64).unwrap_or(0);
    (input, output)
}
