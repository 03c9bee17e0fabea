use futures::StreamExt;
use orcheo::engine::CancelToken;
use orcheo::graph::{GraphCompiler, NodeRegistry, RunConfig};
use orcheo::vault::{CreateCredentialParams, CredentialResolver, CredentialVault, SecretCipher};
use orcheo_backend::memory::InMemoryCredentialStore;
use orcheo_types::{CredentialAccess, CredentialKind, OrcheoError};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

fn compiler() -> GraphCompiler {
    GraphCompiler::new(NodeRegistry::with_builtins())
}

fn run_config(execution_id: &str) -> RunConfig {
    RunConfig {
        execution_id: execution_id.to_string(),
        workflow_id: "wf-test".to_string(),
        cancel: CancelToken::new(),
        step_budget: 100,
        completed: HashSet::new(),
    }
}

async fn collect_steps(
    compiled: &orcheo::graph::CompiledGraph,
    inputs: Value,
    config: RunConfig,
) -> Vec<(String, Value)> {
    let state = compiled.start_state(&inputs);
    let stream = compiled.stream(state, config);
    tokio::pin!(stream);
    let mut steps = Vec::new();
    while let Some(update) = stream.next().await {
        let update = update.expect("step");
        steps.push((update.node_id.clone(), update.payload.clone()));
    }
    steps
}

#[tokio::test]
async fn linear_graph_executes_in_edge_order() {
    let graph = json!({
        "format": "structured",
        "entry": "a",
        "nodes": [
            {"id": "a", "type": "Noop"},
            {"id": "b", "type": "Noop"}
        ],
        "edges": [["a", "b"]]
    });
    let compiled = compiler().compile(&graph, None).await.expect("compile");
    let steps = collect_steps(&compiled, json!({"x": 1}), run_config("exec-linear")).await;
    let order: Vec<&str> = steps.iter().map(|(node, _)| node.as_str()).collect();
    assert_eq!(order, vec!["a", "b"]);
    assert_eq!(steps[0].1, json!({"a": {"ok": true}}));
}

#[tokio::test]
async fn conditional_edges_route_on_predicate_keys() {
    let graph = json!({
        "entry": "classify",
        "nodes": [
            {"id": "classify", "type": "SetValues", "config": {"label": "spam"}},
            {"id": "quarantine", "type": "Noop"},
            {"id": "deliver", "type": "Noop"}
        ],
        "conditional_edges": [{
            "source": "classify",
            "predicate": "label",
            "branches": {"spam": "quarantine", "ham": "deliver"}
        }]
    });
    let compiled = compiler().compile(&graph, None).await.expect("compile");
    let steps = collect_steps(&compiled, json!({}), run_config("exec-branch")).await;
    let order: Vec<&str> = steps.iter().map(|(node, _)| node.as_str()).collect();
    assert_eq!(order, vec!["classify", "quarantine"]);
}

#[tokio::test]
async fn conditional_default_catches_unmapped_keys() {
    let graph = json!({
        "entry": "classify",
        "nodes": [
            {"id": "classify", "type": "SetValues", "config": {"label": "unknown"}},
            {"id": "deliver", "type": "Noop"},
            {"id": "review", "type": "Noop"}
        ],
        "conditional_edges": [{
            "source": "classify",
            "predicate": "label",
            "branches": {"ham": "deliver"},
            "default": "review"
        }]
    });
    let compiled = compiler().compile(&graph, None).await.expect("compile");
    let steps = collect_steps(&compiled, json!({}), run_config("exec-default")).await;
    assert_eq!(steps.last().map(|(node, _)| node.as_str()), Some("review"));
}

#[tokio::test]
async fn unmapped_key_without_default_is_an_execution_error() {
    let graph = json!({
        "entry": "classify",
        "nodes": [
            {"id": "classify", "type": "SetValues", "config": {"label": "unknown"}},
            {"id": "deliver", "type": "Noop"}
        ],
        "conditional_edges": [{
            "source": "classify",
            "predicate": "label",
            "branches": {"ham": "deliver"}
        }]
    });
    let compiled = compiler().compile(&graph, None).await.expect("compile");
    let state = compiled.start_state(&json!({}));
    let stream = compiled.stream(state, run_config("exec-unmapped"));
    tokio::pin!(stream);
    let mut saw_error = false;
    while let Some(item) = stream.next().await {
        if let Err(err) = item {
            assert!(matches!(err, OrcheoError::Execution(_)));
            saw_error = true;
            break;
        }
    }
    assert!(saw_error);
}

#[tokio::test]
async fn cyclic_graphs_hit_the_step_budget() {
    let graph = json!({
        "entry": "loop",
        "nodes": [{"id": "loop", "type": "Noop"}],
        "edges": [["loop", "loop"]]
    });
    let compiled = compiler().compile(&graph, None).await.expect("compile");
    let mut config = run_config("exec-cycle");
    config.step_budget = 5;
    let state = compiled.start_state(&json!({}));
    let stream = compiled.stream(state, config);
    tokio::pin!(stream);
    let mut budget_error = false;
    while let Some(item) = stream.next().await {
        if let Err(err) = item {
            assert!(matches!(err, OrcheoError::StepBudgetExceeded(5)));
            budget_error = true;
            break;
        }
    }
    assert!(budget_error);
}

#[tokio::test]
async fn unknown_node_types_fail_compilation() {
    let graph = json!({
        "entry": "a",
        "nodes": [{"id": "a", "type": "Imaginary"}]
    });
    let err = compiler().compile(&graph, None).await.expect_err("unknown type");
    assert!(matches!(err, OrcheoError::GraphValidation(_)));
}

#[tokio::test]
async fn node_config_strings_resolve_credentials_at_compile_time() {
    let store = Arc::new(InMemoryCredentialStore::new());
    let cipher = Arc::new(SecretCipher::new("compile-test-key").expect("cipher"));
    let vault = Arc::new(CredentialVault::new(store, cipher));
    let workflow = Uuid::new_v4();
    vault
        .create_credential(CreateCredentialParams {
            name: "api_token".to_string(),
            provider: "openai".to_string(),
            kind: CredentialKind::ApiKey,
            secret: "sk-test-123".to_string(),
            actor: "alice".to_string(),
            workflow_id: Some(workflow),
            access: CredentialAccess::Private,
            template_id: None,
            scopes: vec![],
        })
        .await
        .expect("credential");
    let resolver = CredentialResolver::new(vault, Some(workflow));

    let graph = json!({
        "entry": "configure",
        "nodes": [{
            "id": "configure",
            "type": "SetValues",
            "config": {"authorization": "Bearer [[api_token]]"}
        }]
    });
    let compiled = compiler()
        .compile(&graph, Some(&resolver))
        .await
        .expect("compile");
    let steps = collect_steps(&compiled, json!({}), run_config("exec-cred")).await;
    assert_eq!(
        steps[0].1["configure"]["authorization"],
        json!("Bearer sk-test-123")
    );
}

#[tokio::test]
async fn missing_credentials_fail_node_construction() {
    let store = Arc::new(InMemoryCredentialStore::new());
    let cipher = Arc::new(SecretCipher::new("compile-test-key").expect("cipher"));
    let vault = Arc::new(CredentialVault::new(store, cipher));
    let resolver = CredentialResolver::new(vault, Some(Uuid::new_v4()));
    let graph = json!({
        "entry": "configure",
        "nodes": [{
            "id": "configure",
            "type": "SetValues",
            "config": {"authorization": "[[missing_token]]"}
        }]
    });
    let err = compiler()
        .compile(&graph, Some(&resolver))
        .await
        .expect_err("missing credential");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn resume_skips_completed_nodes() {
    let graph = json!({
        "entry": "a",
        "nodes": [
            {"id": "a", "type": "Noop"},
            {"id": "b", "type": "Noop"}
        ],
        "edges": [["a", "b"]]
    });
    let compiled = compiler().compile(&graph, None).await.expect("compile");
    let mut config = run_config("exec-resume");
    config.completed = HashSet::from(["a".to_string()]);
    let steps = collect_steps(&compiled, json!({}), config).await;
    let order: Vec<&str> = steps.iter().map(|(node, _)| node.as_str()).collect();
    assert_eq!(order, vec!["b"]);
}
