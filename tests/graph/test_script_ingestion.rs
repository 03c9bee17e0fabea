use futures::StreamExt;
use orcheo::engine::CancelToken;
use orcheo::graph::{ingest_script, GraphCompiler, NodeRegistry, RunConfig};
use orcheo_types::OrcheoError;
use serde_json::json;
use std::collections::HashSet;

const LINEAR_SCRIPT: &str = r#"
    let g = graph();
    g.node("fetch", "SetValues", #{"status": "fetched"});
    g.node("reply", "Reply", #{"reply": "done"});
    g.edge("fetch", "reply");
    g.entry("fetch");
    g
"#;

#[test]
fn ingested_payload_embeds_source_and_summary() {
    let payload = ingest_script(LINEAR_SCRIPT, None).expect("ingest");
    assert_eq!(payload["format"], json!("script"));
    assert_eq!(payload["source"], json!(LINEAR_SCRIPT));
    assert_eq!(payload["summary"]["nodes"][0]["name"], json!("fetch"));
    assert_eq!(payload["summary"]["edges"][0], json!(["fetch", "reply"]));
}

#[tokio::test]
async fn ingested_scripts_compile_and_execute() {
    let payload = ingest_script(LINEAR_SCRIPT, None).expect("ingest");
    let compiler = GraphCompiler::new(NodeRegistry::with_builtins());
    let compiled = compiler.compile(&payload, None).await.expect("compile");

    let state = compiled.start_state(&json!({}));
    let stream = compiled.stream(
        state,
        RunConfig {
            execution_id: "exec-script".to_string(),
            workflow_id: "wf-script".to_string(),
            cancel: CancelToken::new(),
            step_budget: 50,
            completed: HashSet::new(),
        },
    );
    tokio::pin!(stream);
    let mut order = Vec::new();
    let mut last_state = json!({});
    while let Some(update) = stream.next().await {
        let update = update.expect("step");
        order.push(update.node_id.clone());
        last_state = update.state.clone();
    }
    assert_eq!(order, vec!["fetch", "reply"]);
    assert_eq!(last_state["reply"], json!("done"));
}

#[test]
fn scripts_with_conditional_edges_round_trip() {
    let source = r#"
        let g = graph();
        g.node("triage", "SetValues", #{"label": "urgent"});
        g.node("page", "Noop");
        g.node("queue", "Noop");
        g.conditional_edge("triage", "label", #{"urgent": "page"}, "queue");
        g.entry("triage");
        g
    "#;
    let payload = ingest_script(source, None).expect("ingest");
    let conditional = &payload["summary"]["conditional_edges"][0];
    assert_eq!(conditional["source"], json!("triage"));
    assert_eq!(conditional["mapping"]["urgent"], json!("page"));
    assert_eq!(conditional["default"], json!("queue"));
}

#[test]
fn sandbox_rejects_anything_outside_the_builder_api() {
    for source in [
        r#"import "fs"; graph()"#,
        r#"open("/etc/passwd")"#,
        r#"eval("1 + 1")"#,
    ] {
        let err = ingest_script(source, None).expect_err("sandboxed");
        assert!(matches!(err, OrcheoError::ScriptIngestion(_)), "{source}");
    }
}

#[test]
fn scripts_that_produce_no_builder_fail() {
    let err = ingest_script("40 + 2", None).expect_err("no builder");
    assert!(err.to_string().contains("graph builder"));
}

#[test]
fn ambiguous_factories_need_an_entrypoint() {
    let source = r#"
        fn small() { let g = graph(); g.node("a", "Noop"); g.entry("a"); g }
        fn large() { let g = graph(); g.node("b", "Noop"); g.entry("b"); g }
    "#;
    assert!(ingest_script(source, None).is_err());
    let payload = ingest_script(source, Some("large")).expect("entrypoint");
    assert_eq!(payload["summary"]["nodes"][0]["name"], json!("b"));
    assert_eq!(payload["entrypoint"], json!("large"));
}

#[test]
fn invalid_graphs_fail_ingestion_even_when_the_script_runs() {
    // edge to an unknown node
    let source = r#"
        let g = graph();
        g.node("a", "Noop");
        g.edge("a", "ghost");
        g.entry("a");
        g
    "#;
    let err = ingest_script(source, None).expect_err("invalid graph");
    assert!(err.to_string().contains("ghost"));
}
