use orcheo::engine::{NullProgressSink, RunOutcome};
use orcheo::graph::NodeRegistry;
use orcheo::trace::SpanStatusCode;
use orcheo::{Orcheo, OrcheoConfig};
use orcheo_backend::{BackendConfig, RecordCheckpointParams, RunHistoryStore, WorkflowRepository};
use orcheo_types::{
    generate_publish_token, hash_publish_token, OrcheoError, Workflow, WorkflowRunStatus,
};
use serde_json::json;
use std::sync::Arc;

async fn runtime() -> Orcheo {
    let config = OrcheoConfig::new(BackendConfig::InMemory, "orchestrator-test-key");
    Orcheo::connect(config, NodeRegistry::with_builtins())
        .await
        .expect("runtime")
}

async fn seeded_workflow(runtime: &Orcheo) -> Workflow {
    let workflow = runtime
        .repository()
        .create_workflow(Workflow::new("Demo", None, vec![], "alice").expect("workflow"))
        .await
        .expect("create workflow");
    runtime
        .repository()
        .create_version(
            workflow.id,
            json!({
                "entry": "a",
                "nodes": [
                    {"id": "a", "type": "Noop"},
                    {"id": "b", "type": "Reply", "config": {"reply": "done"}}
                ],
                "edges": [["a", "b"]]
            }),
            json!({}),
            "alice",
            None,
        )
        .await
        .expect("create version");
    workflow
}

#[tokio::test]
async fn run_workflow_end_to_end() {
    let runtime = runtime().await;
    let workflow = seeded_workflow(&runtime).await;

    let (run_id, outcome) = runtime
        .run_workflow(workflow.id, json!({"x": 1}), "alice", Arc::new(NullProgressSink))
        .await
        .expect("run");
    let RunOutcome::Succeeded(output) = outcome else {
        panic!("expected success");
    };
    assert_eq!(output["reply"], json!("done"));

    let runs = runtime
        .repository()
        .list_runs(workflow.id)
        .await
        .expect("list runs");
    assert_eq!(runs.len(), 1);
    assert_eq!(runs[0].status, WorkflowRunStatus::Succeeded);

    // history mirrors the run with gapless steps and a completion marker
    let execution_id = run_id.to_string();
    let record = runtime.history().get(&execution_id).await.expect("record");
    let indices: Vec<i64> = record.steps.iter().map(|step| step.index).collect();
    assert_eq!(indices, vec![0, 1, 2]);

    // trace view: root span OK on the first page
    let trace = runtime.trace(&execution_id, 0, None).await.expect("trace");
    let root = trace
        .spans
        .iter()
        .find(|span| span.parent_span_id.is_none())
        .expect("root span");
    assert_eq!(root.status.code, SpanStatusCode::Ok);
    assert_eq!(trace.execution.status, "completed");
}

#[tokio::test]
async fn runs_require_an_existing_version() {
    let runtime = runtime().await;
    let workflow = runtime
        .repository()
        .create_workflow(Workflow::new("Empty", None, vec![], "alice").expect("workflow"))
        .await
        .expect("create workflow");
    let err = runtime
        .create_run(workflow.id, json!({}), "alice")
        .await
        .expect_err("no versions");
    assert!(matches!(err, OrcheoError::Validation(_)));
}

#[tokio::test]
async fn publish_access_checks_token_and_login() {
    let runtime = runtime().await;
    let workflow = seeded_workflow(&runtime).await;
    let token = generate_publish_token();
    runtime
        .repository()
        .publish_workflow(workflow.id, &hash_publish_token(&token), true, "alice")
        .await
        .expect("publish");

    // correct token + authenticated caller passes
    runtime
        .verify_publish_access(&workflow.slug, &token, true)
        .await
        .expect("access granted");

    // require_login blocks anonymous access even with a valid token
    assert!(matches!(
        runtime
            .verify_publish_access(&workflow.slug, &token, false)
            .await,
        Err(OrcheoError::PublishState(_))
    ));

    // wrong token is rejected
    assert!(runtime
        .verify_publish_access(&workflow.slug, "not-the-token", true)
        .await
        .is_err());

    // unpublished workflows are invisible through the publish surface
    runtime
        .repository()
        .revoke_publish(workflow.id, "alice")
        .await
        .expect("revoke");
    assert!(runtime
        .verify_publish_access(&workflow.slug, &token, true)
        .await
        .expect_err("revoked")
        .is_not_found());
}

#[tokio::test]
async fn cancel_run_only_targets_live_executions() {
    let runtime = runtime().await;
    assert!(!runtime.cancel_run("ghost-execution", Some("why not")));
}

#[tokio::test]
async fn script_ingestion_is_exposed_through_the_facade() {
    let runtime = runtime().await;
    let payload = runtime
        .ingest_script(
            r#"
                let g = graph();
                g.node("a", "Noop");
                g.entry("a");
                g
            "#,
            None,
        )
        .expect("ingest");
    assert_eq!(payload["format"], json!("script"));

    assert!(matches!(
        runtime.ingest_script("not a graph builder", None),
        Err(OrcheoError::ScriptIngestion(_))
    ));
}

#[tokio::test]
async fn agentensor_checkpoints_flow_through_the_facade() {
    let runtime = runtime().await;
    let first = runtime
        .record_checkpoint(RecordCheckpointParams {
            workflow_id: "wf-1".to_string(),
            runnable_config: json!({"lr": 0.01}),
            metrics: json!({"loss": 0.5}),
            metadata: json!({}),
            artifact_url: None,
            is_best: true,
            config_version: None,
        })
        .await
        .expect("record");
    let second = runtime
        .record_checkpoint(RecordCheckpointParams {
            workflow_id: "wf-1".to_string(),
            runnable_config: json!({"lr": 0.005}),
            metrics: json!({"loss": 0.4}),
            metadata: json!({}),
            artifact_url: None,
            is_best: true,
            config_version: None,
        })
        .await
        .expect("record");

    let listed = runtime.list_checkpoints("wf-1", None).await.expect("list");
    assert_eq!(listed.len(), 2);
    assert!(listed.iter().filter(|checkpoint| checkpoint.is_best).count() <= 1);
    let latest = runtime
        .latest_checkpoint("wf-1")
        .await
        .expect("latest")
        .expect("some");
    assert_eq!(latest.id, second.id);
    let loaded = runtime.get_checkpoint(&first.id).await.expect("get");
    assert!(!loaded.is_best);
}

#[tokio::test]
async fn unhealthy_credentials_block_execution() {
    use orcheo::vault::CreateCredentialParams;
    use orcheo_types::{CredentialAccess, CredentialKind};

    let runtime = runtime().await;
    let workflow = seeded_workflow(&runtime).await;
    // an OAUTH credential with no registered provider renders the
    // workflow unhealthy
    runtime
        .vault()
        .create_credential(CreateCredentialParams {
            name: "broken-oauth".to_string(),
            provider: "unregistered".to_string(),
            kind: CredentialKind::Oauth,
            secret: serde_json::to_string(&orcheo_types::OAuthTokenSecrets {
                access_token: "a".to_string(),
                refresh_token: None,
                expires_at: None,
                scope: None,
            })
            .expect("tokens"),
            actor: "alice".to_string(),
            workflow_id: Some(workflow.id),
            access: CredentialAccess::Private,
            template_id: None,
            scopes: vec![],
        })
        .await
        .expect("credential");

    let err = runtime
        .run_workflow(workflow.id, json!({}), "alice", Arc::new(NullProgressSink))
        .await
        .expect_err("health gate blocks");
    assert!(matches!(err, OrcheoError::CredentialHealth(_)));
}
