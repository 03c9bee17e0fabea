use orcheo_backend::memory::InMemoryAgentensorCheckpointStore;
use orcheo_backend::sqlite::{SqliteAgentensorCheckpointStore, SqliteBackend};
use orcheo_backend::{AgentensorCheckpointStore, RecordCheckpointParams};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

fn params(workflow_id: &str, is_best: bool) -> RecordCheckpointParams {
    RecordCheckpointParams {
        workflow_id: workflow_id.to_string(),
        runnable_config: json!({"temperature": 0.2}),
        metrics: json!({"loss": 0.31}),
        metadata: json!({"trainer": "agentensor"}),
        artifact_url: None,
        is_best,
        config_version: None,
    }
}

async fn sqlite_store() -> (TempDir, SqliteAgentensorCheckpointStore) {
    let dir = TempDir::new().expect("tempdir");
    let backend = SqliteBackend::connect(&dir.path().join("checkpoints.db"))
        .await
        .expect("connect");
    (dir, SqliteAgentensorCheckpointStore::new(backend))
}

async fn assert_store_contract(store: &dyn AgentensorCheckpointStore) {
    for expected in 1..=3 {
        let checkpoint = store
            .record_checkpoint(params("wf-1", false))
            .await
            .expect("record");
        assert_eq!(checkpoint.config_version, expected);
    }
    // explicit version is honoured
    let mut explicit = params("wf-1", false);
    explicit.config_version = Some(10);
    let checkpoint = store.record_checkpoint(explicit).await.expect("record");
    assert_eq!(checkpoint.config_version, 10);

    let listed = store.list_checkpoints("wf-1", None).await.expect("list");
    let versions: Vec<i64> = listed
        .iter()
        .map(|checkpoint| checkpoint.config_version)
        .collect();
    assert_eq!(versions, vec![10, 3, 2, 1]);

    let latest = store
        .latest_checkpoint("wf-1")
        .await
        .expect("latest")
        .expect("some");
    assert_eq!(latest.config_version, 10);

    let limited = store.list_checkpoints("wf-1", Some(2)).await.expect("list");
    assert_eq!(limited.len(), 2);

    assert!(store
        .get_checkpoint("missing")
        .await
        .expect_err("missing")
        .is_not_found());
}

#[tokio::test]
async fn in_memory_store_contract() {
    let store = InMemoryAgentensorCheckpointStore::new();
    assert_store_contract(&store).await;
}

#[tokio::test]
async fn sqlite_store_contract() {
    let (_dir, store) = sqlite_store().await;
    assert_store_contract(&store).await;
}

#[tokio::test]
async fn best_flag_is_unique_under_concurrent_promotion() {
    let (_dir, store) = sqlite_store().await;
    let store = Arc::new(store);
    let mut handles = Vec::new();
    for _ in 0..6 {
        let store = Arc::clone(&store);
        handles.push(tokio::spawn(async move {
            store
                .record_checkpoint(params("wf-1", true))
                .await
                .expect("record")
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    let checkpoints = store.list_checkpoints("wf-1", None).await.expect("list");
    assert_eq!(checkpoints.len(), 6);
    let mut versions: Vec<i64> = checkpoints
        .iter()
        .map(|checkpoint| checkpoint.config_version)
        .collect();
    versions.sort_unstable();
    assert_eq!(versions, (1..=6).collect::<Vec<i64>>());
    let best_count = checkpoints
        .iter()
        .filter(|checkpoint| checkpoint.is_best)
        .count();
    assert_eq!(best_count, 1);
}

#[tokio::test]
async fn workflows_do_not_share_version_sequences() {
    let store = InMemoryAgentensorCheckpointStore::new();
    store.record_checkpoint(params("wf-1", false)).await.expect("record");
    store.record_checkpoint(params("wf-1", false)).await.expect("record");
    let other = store.record_checkpoint(params("wf-2", true)).await.expect("record");
    assert_eq!(other.config_version, 1);
    assert!(other.is_best);
    // wf-1's checkpoints are untouched by wf-2's promotion
    let first = store.list_checkpoints("wf-1", None).await.expect("list");
    assert!(first.iter().all(|checkpoint| !checkpoint.is_best));
}
