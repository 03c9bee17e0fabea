use chrono::{Duration, Utc};
use orcheo::chat::{ChatContext, ChatService, RUNS_MIRROR_LIMIT};
use orcheo_backend::memory::InMemoryChatStore;
use orcheo_types::{SortOrder, ThreadItem, ThreadMetadata};
use serde_json::json;
use std::sync::Arc;

fn service() -> Arc<ChatService> {
    Arc::new(ChatService::new(Arc::new(InMemoryChatStore::new())))
}

fn item(id: &str) -> ThreadItem {
    ThreadItem {
        id: id.to_string(),
        thread_id: String::new(),
        ordinal: 0,
        item_type: "message".to_string(),
        created_at: Utc::now(),
        payload: json!({"text": id}),
    }
}

#[tokio::test]
async fn save_thread_merges_context_without_overwriting() {
    let service = service();
    let mut thread = ThreadMetadata::new("t1");
    thread.metadata = json!({"workflow_id": "explicit-wf"});
    service
        .save_thread(
            thread,
            &ChatContext {
                workflow_id: Some("ctx-wf".to_string()),
                workflow_name: Some("Demo".to_string()),
            },
        )
        .await
        .expect("save");

    let loaded = service.load_thread("t1").await.expect("load");
    // explicit fields win; missing fields are filled from the context
    assert_eq!(loaded.metadata["workflow_id"], json!("explicit-wf"));
    assert_eq!(loaded.metadata["workflow_name"], json!("Demo"));
}

#[tokio::test]
async fn runs_mirror_dedupes_and_caps_at_twenty() {
    let service = service();
    service
        .save_thread(ThreadMetadata::new("t1"), &ChatContext::default())
        .await
        .expect("save");

    for n in 0..(RUNS_MIRROR_LIMIT + 5) {
        service
            .record_run_for_thread("t1", &format!("exec-{n}"))
            .await
            .expect("record");
    }
    // re-recording an existing id moves it to the end without duplicates
    service
        .record_run_for_thread("t1", "exec-10")
        .await
        .expect("record");

    let loaded = service.load_thread("t1").await.expect("load");
    let runs: Vec<&str> = loaded.metadata["runs"]
        .as_array()
        .expect("runs array")
        .iter()
        .filter_map(|value| value.as_str())
        .collect();
    assert!(runs.len() <= RUNS_MIRROR_LIMIT);
    assert_eq!(runs.last().copied(), Some("exec-10"));
    let mut deduped = runs.clone();
    deduped.sort_unstable();
    deduped.dedup();
    assert_eq!(deduped.len(), runs.len());
}

#[tokio::test]
async fn items_flow_through_the_service() {
    let service = service();
    service
        .add_thread_item("t1", item("m0"))
        .await
        .expect("add");
    service
        .add_thread_item("t1", item("m1"))
        .await
        .expect("add");
    let page = service
        .load_thread_items("t1", None, 10, SortOrder::Asc)
        .await
        .expect("load");
    assert_eq!(page.data.len(), 2);
    let found = service
        .search_thread_items("t1", "m1", None, 10)
        .await
        .expect("search");
    assert_eq!(found.data.len(), 1);
}

#[tokio::test]
async fn prune_removes_only_stale_threads() {
    let service = service();
    service
        .add_thread_item("stale", item("m0"))
        .await
        .expect("add");
    let cutoff = Utc::now() + Duration::milliseconds(1);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    service
        .add_thread_item("active", item("m1"))
        .await
        .expect("add");

    let pruned = service
        .prune_threads_older_than(cutoff)
        .await
        .expect("prune");
    assert_eq!(pruned, 1);
    assert!(service.load_thread("stale").await.is_err());
    assert!(service.load_thread("active").await.is_ok());
}

#[tokio::test]
async fn retention_loop_prunes_on_schedule() {
    let service = service();
    service
        .add_thread_item("old", item("m0"))
        .await
        .expect("add");

    // a zero retention window prunes everything older than "now"
    let handle = service.spawn_retention_loop(
        std::time::Duration::from_secs(0),
        std::time::Duration::from_millis(10),
    );
    tokio::time::sleep(std::time::Duration::from_millis(60)).await;
    handle.abort();

    assert!(service.load_thread("old").await.is_err());
}
