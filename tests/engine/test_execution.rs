use async_trait::async_trait;
use orcheo::engine::{
    CancelToken, ChannelProgressSink, EngineSettings, ExecutionEngine, ExecutionEvent,
    InMemoryCheckpointer, NodeCheckpointer, NullProgressSink, RunOutcome, RunRequest,
};
use orcheo::graph::{register_builtins, GraphCompiler, Node, NodeContext, NodeRegistry};
use orcheo::trace::SpanStatusCode;
use orcheo_backend::memory::{InMemoryRunHistoryStore, InMemoryWorkflowRepository};
use orcheo_backend::{RunHistoryStore, WorkflowRepository};
use orcheo_types::{
    OrcheoError, RunHistoryStatus, Workflow, WorkflowRun, WorkflowRunStatus, WorkflowVersion,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Trips the run's cancel token from inside node execution.
struct TripCancelNode {
    reason: String,
}

#[async_trait]
impl Node for TripCancelNode {
    async fn run(&self, _state: &Value, ctx: &NodeContext) -> Result<Value, OrcheoError> {
        ctx.cancel.trigger(Some(&self.reason));
        Ok(json!({"ok": true}))
    }
}

/// Fails on the first invocation, succeeds afterwards.
struct FlakyOnceNode {
    attempts: Arc<AtomicUsize>,
}

#[async_trait]
impl Node for FlakyOnceNode {
    async fn run(&self, _state: &Value, _ctx: &NodeContext) -> Result<Value, OrcheoError> {
        if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(OrcheoError::Execution("transient upstream outage".to_string()));
        }
        Ok(json!({"recovered": true}))
    }
}

/// Counts how many times it ran.
struct CountingNode {
    runs: Arc<AtomicUsize>,
}

#[async_trait]
impl Node for CountingNode {
    async fn run(&self, _state: &Value, _ctx: &NodeContext) -> Result<Value, OrcheoError> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"ok": true}))
    }
}

struct Harness {
    engine: ExecutionEngine,
    history: Arc<InMemoryRunHistoryStore>,
    repository: Arc<InMemoryWorkflowRepository>,
    checkpointer: Arc<InMemoryCheckpointer>,
}

fn harness(registry: NodeRegistry, settings: EngineSettings) -> Harness {
    let history = Arc::new(InMemoryRunHistoryStore::new());
    let repository = Arc::new(InMemoryWorkflowRepository::new());
    let checkpointer = Arc::new(InMemoryCheckpointer::new());
    let engine = ExecutionEngine::new(
        GraphCompiler::new(registry),
        history.clone(),
        repository.clone(),
        checkpointer.clone(),
        settings,
    );
    Harness {
        engine,
        history,
        repository,
        checkpointer,
    }
}

async fn seed_run(
    repository: &InMemoryWorkflowRepository,
    graph: Value,
    inputs: Value,
) -> (Workflow, WorkflowVersion, WorkflowRun) {
    let workflow = repository
        .create_workflow(Workflow::new("Demo", None, vec![], "alice").expect("workflow"))
        .await
        .expect("create workflow");
    let version = repository
        .create_version(workflow.id, graph, json!({}), "alice", None)
        .await
        .expect("create version");
    let run = repository
        .create_run(WorkflowRun::new(workflow.id, version.id, "alice", inputs))
        .await
        .expect("create run");
    (workflow, version, run)
}

#[tokio::test]
async fn happy_path_records_steps_history_and_output() {
    let harness = harness(NodeRegistry::with_builtins(), EngineSettings::default());
    let graph = json!({
        "entry": "a",
        "nodes": [
            {"id": "a", "type": "Noop"},
            {"id": "b", "type": "Reply", "config": {"reply": "done"}}
        ],
        "edges": [["a", "b"]]
    });
    let (workflow, version, run) =
        seed_run(&harness.repository, graph, json!({"x": 1})).await;

    let (sender, mut receiver) = tokio::sync::mpsc::unbounded_channel();
    let outcome = harness
        .engine
        .run(
            RunRequest {
                run_id: run.id,
                workflow_id: workflow.id,
                version,
                inputs: json!({"x": 1}),
                execution_id: "exec-happy".to_string(),
                resolver: None,
                actor: "alice".to_string(),
            },
            Arc::new(ChannelProgressSink::new(sender)),
            CancelToken::new(),
        )
        .await
        .expect("run");

    let RunOutcome::Succeeded(output) = outcome else {
        panic!("expected success");
    };
    assert_eq!(output["reply"], json!("done"));

    // repository is the source of truth for the terminal state
    let stored = harness.repository.get_run(run.id).await.expect("run");
    assert_eq!(stored.status, WorkflowRunStatus::Succeeded);
    assert_eq!(
        stored.output_payload.as_ref().map(|output| &output["reply"]),
        Some(&json!("done"))
    );
    let runs = harness
        .repository
        .list_runs(workflow.id)
        .await
        .expect("list runs");
    assert_eq!(runs.len(), 1);

    // history: node steps plus the completion marker, gapless
    let record = harness.history.get("exec-happy").await.expect("record");
    assert_eq!(record.status, RunHistoryStatus::Completed);
    let indices: Vec<i64> = record.steps.iter().map(|step| step.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);
    assert_eq!(record.steps[0].payload, json!({"a": {"ok": true}}));
    assert_eq!(record.steps[2].payload, json!({"status": "completed"}));

    // emitted events: root trace, node steps interleaved with trace
    // deltas, then the completion with root status OK
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    let node_steps: Vec<&Value> = events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::NodeStep { payload, .. } => Some(payload),
            _ => None,
        })
        .collect();
    assert_eq!(node_steps.len(), 2);
    let completion = events
        .iter()
        .filter_map(|event| match event {
            ExecutionEvent::TraceUpdate(message) if message.complete => Some(message),
            _ => None,
        })
        .last()
        .expect("completion message");
    let root_span = completion
        .spans
        .iter()
        .find(|span| span.parent_span_id.is_none())
        .expect("root span");
    assert_eq!(root_span.status.code, SpanStatusCode::Ok);
}

#[tokio::test]
async fn cancellation_discards_the_inflight_result() {
    let mut builder = NodeRegistry::builder();
    register_builtins(&mut builder);
    builder.register("TripCancel", |_config| {
        Ok(Arc::new(TripCancelNode {
            reason: "user-cancel".to_string(),
        }) as Arc<dyn Node>)
    });
    let harness = harness(builder.build(), EngineSettings::default());

    let graph = json!({
        "entry": "a",
        "nodes": [
            {"id": "a", "type": "Noop"},
            {"id": "trip", "type": "TripCancel"},
            {"id": "never", "type": "Noop"}
        ],
        "edges": [["a", "trip"], ["trip", "never"]]
    });
    let (workflow, version, run) = seed_run(&harness.repository, graph, json!({})).await;

    let outcome = harness
        .engine
        .run(
            RunRequest {
                run_id: run.id,
                workflow_id: workflow.id,
                version,
                inputs: json!({}),
                execution_id: "exec-cancel".to_string(),
                resolver: None,
                actor: "alice".to_string(),
            },
            Arc::new(NullProgressSink),
            CancelToken::new(),
        )
        .await
        .expect("run");
    let RunOutcome::Cancelled(reason) = outcome else {
        panic!("expected cancellation");
    };
    assert_eq!(reason, "user-cancel");

    let record = harness.history.get("exec-cancel").await.expect("record");
    assert_eq!(record.status, RunHistoryStatus::Cancelled);
    assert_eq!(record.error.as_deref(), Some("user-cancel"));
    // the tripping node's own result was discarded
    assert_eq!(record.steps.len(), 2);
    assert_eq!(record.steps[0].payload, json!({"a": {"ok": true}}));
    assert_eq!(
        record.steps[1].payload,
        json!({"status": "cancelled", "reason": "user-cancel"})
    );

    let stored = harness.repository.get_run(run.id).await.expect("run");
    assert_eq!(stored.status, WorkflowRunStatus::Cancelled);
}

#[tokio::test]
async fn node_failures_mark_the_run_failed() {
    let harness = harness(NodeRegistry::with_builtins(), EngineSettings::default());
    let graph = json!({
        "entry": "a",
        "nodes": [
            {"id": "a", "type": "Noop"},
            {"id": "bad", "type": "Fail", "config": {"message": "node exploded"}}
        ],
        "edges": [["a", "bad"]]
    });
    let (workflow, version, run) = seed_run(&harness.repository, graph, json!({})).await;

    let err = harness
        .engine
        .run(
            RunRequest {
                run_id: run.id,
                workflow_id: workflow.id,
                version,
                inputs: json!({}),
                execution_id: "exec-fail".to_string(),
                resolver: None,
                actor: "alice".to_string(),
            },
            Arc::new(NullProgressSink),
            CancelToken::new(),
        )
        .await
        .expect_err("failure propagates");
    assert!(err.to_string().contains("node exploded"));

    let record = harness.history.get("exec-fail").await.expect("record");
    assert_eq!(record.status, RunHistoryStatus::Failed);
    let last = record.steps.last().expect("error step");
    assert_eq!(last.payload["status"], json!("error"));

    let stored = harness.repository.get_run(run.id).await.expect("run");
    assert_eq!(stored.status, WorkflowRunStatus::Failed);
}

#[tokio::test]
async fn step_budget_terminates_cyclic_runs_as_failed() {
    let harness = harness(
        NodeRegistry::with_builtins(),
        EngineSettings {
            step_budget: 4,
            ..EngineSettings::default()
        },
    );
    let graph = json!({
        "entry": "loop",
        "nodes": [{"id": "loop", "type": "Noop"}],
        "edges": [["loop", "loop"]]
    });
    let (workflow, version, run) = seed_run(&harness.repository, graph, json!({})).await;

    let err = harness
        .engine
        .run(
            RunRequest {
                run_id: run.id,
                workflow_id: workflow.id,
                version,
                inputs: json!({}),
                execution_id: "exec-budget".to_string(),
                resolver: None,
                actor: "alice".to_string(),
            },
            Arc::new(NullProgressSink),
            CancelToken::new(),
        )
        .await
        .expect_err("budget breach");
    assert!(matches!(err, OrcheoError::StepBudgetExceeded(4)));
    let stored = harness.repository.get_run(run.id).await.expect("run");
    assert_eq!(stored.status, WorkflowRunStatus::Failed);
}

#[tokio::test]
async fn resume_with_same_execution_id_skips_completed_nodes() {
    let first_runs = Arc::new(AtomicUsize::new(0));
    let flaky_attempts = Arc::new(AtomicUsize::new(0));
    let mut builder = NodeRegistry::builder();
    register_builtins(&mut builder);
    {
        let runs = first_runs.clone();
        builder.register("Counting", move |_config| {
            Ok(Arc::new(CountingNode { runs: runs.clone() }) as Arc<dyn Node>)
        });
    }
    {
        let attempts = flaky_attempts.clone();
        builder.register("FlakyOnce", move |_config| {
            Ok(Arc::new(FlakyOnceNode {
                attempts: attempts.clone(),
            }) as Arc<dyn Node>)
        });
    }
    let harness = harness(builder.build(), EngineSettings::default());

    let graph = json!({
        "entry": "a",
        "nodes": [
            {"id": "a", "type": "Counting"},
            {"id": "b", "type": "FlakyOnce"}
        ],
        "edges": [["a", "b"]]
    });
    let (workflow, version, run) = seed_run(&harness.repository, graph, json!({})).await;

    let request = |run_id| RunRequest {
        run_id,
        workflow_id: workflow.id,
        version: version.clone(),
        inputs: json!({}),
        execution_id: "exec-resume".to_string(),
        resolver: None,
        actor: "alice".to_string(),
    };

    // first attempt fails at node b, leaving a checkpoint with node a
    harness
        .engine
        .run(request(run.id), Arc::new(NullProgressSink), CancelToken::new())
        .await
        .expect_err("first attempt fails");
    let checkpoint = harness
        .checkpointer
        .load("exec-resume")
        .await
        .expect("load")
        .expect("checkpoint exists");
    assert_eq!(checkpoint.completed, vec!["a"]);

    // a retry run with the same execution id resumes past node a
    let retry = harness
        .repository
        .create_run(WorkflowRun::new(workflow.id, version.id, "alice", json!({})))
        .await
        .expect("retry run");
    let outcome = harness
        .engine
        .run(request(retry.id), Arc::new(NullProgressSink), CancelToken::new())
        .await
        .expect("resumed run succeeds");
    assert!(matches!(outcome, RunOutcome::Succeeded(_)));
    assert_eq!(first_runs.load(Ordering::SeqCst), 1);
    assert_eq!(flaky_attempts.load(Ordering::SeqCst), 2);

    let stored = harness.repository.get_run(retry.id).await.expect("run");
    assert_eq!(stored.status, WorkflowRunStatus::Succeeded);
    // the successful resume clears the checkpoint
    assert!(harness
        .checkpointer
        .load("exec-resume")
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn second_driver_for_a_live_execution_is_rejected() {
    let harness = harness(NodeRegistry::with_builtins(), EngineSettings::default());
    let graph = json!({
        "entry": "a",
        "nodes": [{"id": "a", "type": "Noop"}]
    });
    let (workflow, version, run) = seed_run(&harness.repository, graph, json!({})).await;
    let request = |run_id| RunRequest {
        run_id,
        workflow_id: workflow.id,
        version: version.clone(),
        inputs: json!({}),
        execution_id: "exec-unique".to_string(),
        resolver: None,
        actor: "alice".to_string(),
    };
    harness
        .engine
        .run(request(run.id), Arc::new(NullProgressSink), CancelToken::new())
        .await
        .expect("first driver");
    // no checkpoint survives success, so re-driving the id is an error
    let second = harness
        .repository
        .create_run(WorkflowRun::new(workflow.id, version.id, "alice", json!({})))
        .await
        .expect("second run");
    let err = harness
        .engine
        .run(request(second.id), Arc::new(NullProgressSink), CancelToken::new())
        .await
        .expect_err("duplicate execution id");
    assert!(matches!(err, OrcheoError::Execution(_)));
}
