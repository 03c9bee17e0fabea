use chrono::Utc;
use orcheo_backend::memory::InMemoryRunHistoryStore;
use orcheo_backend::sqlite::{SqliteBackend, SqliteRunHistoryStore};
use orcheo_backend::RunHistoryStore;
use orcheo_types::{OrcheoError, RunHistoryStatus, RunStartRequest, TraceMetadataUpdate};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

async fn sqlite_store() -> (TempDir, SqliteRunHistoryStore) {
    let dir = TempDir::new().expect("tempdir");
    let backend = SqliteBackend::connect(&dir.path().join("history.db"))
        .await
        .expect("connect");
    (dir, SqliteRunHistoryStore::new(backend))
}

async fn assert_history_contract(store: &dyn RunHistoryStore) {
    store
        .start_run(RunStartRequest::new("exec-1", "wf-1", json!({"x": 1})))
        .await
        .expect("start");

    // duplicate execution id is rejected
    assert!(store
        .start_run(RunStartRequest::new("exec-1", "wf-1", json!({})))
        .await
        .is_err());

    for n in 0..4 {
        let step = store
            .append_step("exec-1", json!({"node": {"n": n}}))
            .await
            .expect("append");
        assert_eq!(step.index, n);
    }

    let record = store.get("exec-1").await.expect("get");
    let indices: Vec<i64> = record.steps.iter().map(|step| step.index).collect();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(record.status, RunHistoryStatus::Running);
    assert!(record.trace_last_span_at.is_some());

    let window = store.list_steps("exec-1", 1, Some(2)).await.expect("window");
    assert_eq!(
        window.iter().map(|step| step.index).collect::<Vec<_>>(),
        vec![1, 2]
    );

    store.mark_completed("exec-1").await.expect("complete");
    store.mark_completed("exec-1").await.expect("idempotent");
    assert!(matches!(
        store.mark_failed("exec-1", "late").await,
        Err(OrcheoError::InvalidTransition(_))
    ));

    assert!(store
        .append_step("ghost", json!({}))
        .await
        .expect_err("unknown execution")
        .is_not_found());
}

#[tokio::test]
async fn in_memory_store_honours_the_contract() {
    let store = InMemoryRunHistoryStore::new();
    assert_history_contract(&store).await;
}

#[tokio::test]
async fn sqlite_store_honours_the_contract() {
    let (_dir, store) = sqlite_store().await;
    assert_history_contract(&store).await;
}

#[tokio::test]
async fn trace_metadata_updates_are_partial() {
    let (_dir, store) = sqlite_store().await;
    store
        .start_run(RunStartRequest::new("exec-1", "wf-1", json!({})))
        .await
        .expect("start");
    let started = Utc::now();
    store
        .update_trace_metadata(
            "exec-1",
            TraceMetadataUpdate {
                trace_id: Some("trace-a".to_string()),
                started_at: Some(started),
                updated_at: None,
            },
        )
        .await
        .expect("update");
    store
        .update_trace_metadata(
            "exec-1",
            TraceMetadataUpdate {
                trace_id: None,
                started_at: None,
                updated_at: Some(Utc::now()),
            },
        )
        .await
        .expect("update");
    let record = store.get("exec-1").await.expect("get");
    assert_eq!(record.trace_id.as_deref(), Some("trace-a"));
    assert!(record.trace_started_at.is_some());
    assert!(record.trace_last_span_at.is_some());
}

#[tokio::test]
async fn concurrent_appends_stay_gapless() {
    let (_dir, store) = sqlite_store().await;
    let store = Arc::new(store);
    store
        .start_run(RunStartRequest::new("exec-1", "wf-1", json!({})))
        .await
        .expect("start");
    let mut handles = Vec::new();
    for n in 0..8 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .append_step("exec-1", json!({"writer": n}))
                .await
                .expect("append")
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }
    let record = store.get("exec-1").await.expect("get");
    let mut indices: Vec<i64> = record.steps.iter().map(|step| step.index).collect();
    indices.sort_unstable();
    assert_eq!(indices, (0..8).collect::<Vec<i64>>());
}

#[tokio::test]
async fn runs_are_listed_per_workflow() {
    let (_dir, store) = sqlite_store().await;
    store
        .start_run(RunStartRequest::new("exec-1", "wf-1", json!({})))
        .await
        .expect("start");
    store
        .start_run(RunStartRequest::new("exec-2", "wf-1", json!({})))
        .await
        .expect("start");
    store
        .start_run(RunStartRequest::new("exec-3", "wf-2", json!({})))
        .await
        .expect("start");
    let records = store.list_for_workflow("wf-1").await.expect("list");
    assert_eq!(records.len(), 2);
    assert!(records
        .iter()
        .all(|record| record.workflow_id == "wf-1"));
}
