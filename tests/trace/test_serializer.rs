use chrono::{Duration, Utc};
use orcheo::trace::{
    spans_for_step, trace_completion_message, trace_response, trace_update_message,
    RootSpanContext, SpanStatusCode, TraceUpdateArgs, MAX_ATTRIBUTE_CHARS, MAX_SEQUENCE_ITEMS,
};
use orcheo_types::{RunHistoryRecord, RunHistoryStatus, RunHistoryStep};
use serde_json::{json, Value};

fn record_with_steps(steps: Vec<Value>) -> RunHistoryRecord {
    let started = Utc::now() - Duration::seconds(60);
    let steps = steps
        .into_iter()
        .enumerate()
        .map(|(index, payload)| RunHistoryStep {
            index: index as i64,
            at: started + Duration::seconds(index as i64),
            payload,
        })
        .collect();
    RunHistoryRecord {
        execution_id: "exec-1".to_string(),
        workflow_id: "wf-1".to_string(),
        status: RunHistoryStatus::Completed,
        started_at: started,
        completed_at: Some(Utc::now()),
        error: None,
        inputs: json!({"question": "hello"}),
        runnable_config: None,
        steps,
        trace_id: Some("trace-1".to_string()),
        trace_started_at: Some(started),
        trace_completed_at: Some(Utc::now()),
        trace_last_span_at: Some(Utc::now()),
    }
}

#[test]
fn first_page_carries_the_root_span_only_once() {
    let record = record_with_steps(vec![
        json!({"a": {"ok": true}}),
        json!({"b": {"ok": true}}),
        json!({"status": "completed"}),
    ]);

    let first = trace_response(&record, 0, Some(2));
    let roots = first
        .spans
        .iter()
        .filter(|span| span.parent_span_id.is_none())
        .count();
    assert_eq!(roots, 1);
    assert!(first.page_info.has_next_page);
    assert_eq!(first.page_info.cursor, Some(2));

    let second = trace_response(&record, 2, Some(2));
    assert!(second
        .spans
        .iter()
        .all(|span| span.parent_span_id.is_some()));
    assert!(!second.page_info.has_next_page);
}

#[test]
fn spans_are_sorted_deterministically() {
    let record = record_with_steps(vec![
        json!({"a": {"ok": true}}),
        json!({"b": {"ok": true}}),
    ]);
    let response = trace_response(&record, 0, None);
    let mut sorted = response.spans.clone();
    sorted.sort_by(|left, right| {
        (left.start_time, left.span_id.clone()).cmp(&(right.start_time, right.span_id.clone()))
    });
    let span_ids: Vec<&str> = response.spans.iter().map(|span| span.span_id.as_str()).collect();
    let sorted_ids: Vec<&str> = sorted.iter().map(|span| span.span_id.as_str()).collect();
    assert_eq!(span_ids, sorted_ids);
}

#[test]
fn token_usage_aggregates_across_all_steps_not_the_page() {
    let record = record_with_steps(vec![
        json!({"a": {"token_usage": {"input": 10, "output": 4}}}),
        json!({"b": {"usage": {"input": 5, "output": 2}}}),
    ]);
    let response = trace_response(&record, 1, None);
    let usage = response.execution.token_usage.expect("usage");
    assert_eq!(usage.input, 15);
    assert_eq!(usage.output, 6);
}

#[test]
fn attribute_truncation_limits_hold_for_any_payload() {
    let long_text = "p".repeat(5000);
    let many_items: Vec<Value> = (0..60).map(|n| json!(format!("response-{n}"))).collect();
    let record = record_with_steps(vec![json!({
        "agent": {
            "prompt": long_text,
            "responses": many_items,
        }
    })]);
    let response = trace_response(&record, 0, None);
    let step_span = response
        .spans
        .iter()
        .find(|span| span.parent_span_id.is_some())
        .expect("step span");

    for value in step_span.attributes.values() {
        match value {
            Value::String(text) => {
                assert!(text.chars().count() <= MAX_ATTRIBUTE_CHARS + 1);
            }
            Value::Array(items) => {
                assert!(items.len() <= MAX_SEQUENCE_ITEMS + 1);
                if items.len() == MAX_SEQUENCE_ITEMS + 1 {
                    let sentinel = items.last().and_then(Value::as_str).expect("sentinel");
                    assert!(sentinel.starts_with("...(+"));
                }
            }
            _ => {}
        }
    }
}

#[test]
fn step_spans_use_node_names_and_status_mapping() {
    let record = record_with_steps(vec![
        json!({"fetch": {"status": "success"}}),
        json!({"status": "cancelled", "reason": "user-cancel"}),
    ]);
    let spans: Vec<_> = record
        .steps
        .iter()
        .flat_map(|step| spans_for_step("exec-1", step))
        .collect();

    assert_eq!(spans[0].name, "workflow.step.fetch");
    assert_eq!(spans[0].status.code, SpanStatusCode::Ok);

    // terminal cancellation step: indexed name, ERROR with the reason
    assert_eq!(spans[1].name, "workflow.step.1");
    assert_eq!(spans[1].status.code, SpanStatusCode::Error);
    assert_eq!(spans[1].status.message.as_deref(), Some("user-cancel"));
}

#[test]
fn update_message_defaults_cursor_to_next_step_index() {
    let record = record_with_steps(vec![
        json!({"a": {"ok": true}}),
        json!({"b": {"ok": true}}),
    ]);
    let message = trace_update_message(
        "exec-1",
        Some("trace-1"),
        TraceUpdateArgs {
            root: None,
            steps: &record.steps[1..2],
            complete: false,
            cursor: None,
        },
    )
    .expect("message");
    assert_eq!(message.cursor, 2);
    assert!(!message.complete);
    assert_eq!(message.message_type, "trace:update");
    assert_eq!(message.spans.len(), 1);
}

#[test]
fn empty_incomplete_updates_are_suppressed() {
    let message = trace_update_message(
        "exec-1",
        None,
        TraceUpdateArgs {
            root: None,
            steps: &[],
            complete: false,
            cursor: None,
        },
    );
    assert!(message.is_none());
}

#[test]
fn completion_message_closes_the_root_span() {
    let mut record = record_with_steps(vec![json!({"a": {"ok": true}})]);
    record.status = RunHistoryStatus::Failed;
    record.error = Some("node exploded".to_string());
    let message = trace_completion_message(&record).expect("message");
    assert!(message.complete);
    assert_eq!(message.cursor, 1);
    let root = message
        .spans
        .iter()
        .find(|span| span.parent_span_id.is_none())
        .expect("root");
    assert_eq!(root.status.code, SpanStatusCode::Error);
    assert_eq!(root.status.message.as_deref(), Some("node exploded"));
    assert!(root.end_time.is_some());
}

#[test]
fn root_span_attributes_include_truncated_inputs() {
    let context = RootSpanContext {
        execution_id: "exec-1".to_string(),
        workflow_id: "wf-1".to_string(),
        trace_id: Some("trace-1".to_string()),
        started_at: Utc::now(),
        completed_at: None,
        status: "running".to_string(),
        error: None,
        inputs: Some(json!({"blob": "z".repeat(4000)})),
    };
    let message = trace_update_message(
        "exec-1",
        Some("trace-1"),
        TraceUpdateArgs {
            root: Some(&context),
            steps: &[],
            complete: false,
            cursor: Some(0),
        },
    )
    .expect("message");
    let root = &message.spans[0];
    assert_eq!(root.attributes["orcheo.workflow.id"], json!("wf-1"));
    assert_eq!(root.attributes["orcheo.execution.status"], json!("running"));
    let inputs = root.attributes["orcheo.workflow.inputs"]
        .as_str()
        .expect("stringified inputs");
    assert!(inputs.chars().count() <= MAX_ATTRIBUTE_CHARS + 1);
}
