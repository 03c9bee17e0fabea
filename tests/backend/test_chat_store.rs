use chrono::{Duration, Utc};
use orcheo_backend::memory::InMemoryChatStore;
use orcheo_backend::sqlite::{SqliteBackend, SqliteChatStore};
use orcheo_backend::ChatStore;
use orcheo_types::{SortOrder, ThreadItem, ThreadMetadata};
use serde_json::json;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::Row;
use tempfile::TempDir;

fn item(id: &str, thread_id: &str) -> ThreadItem {
    ThreadItem {
        id: id.to_string(),
        thread_id: thread_id.to_string(),
        ordinal: 0,
        item_type: "message".to_string(),
        created_at: Utc::now(),
        payload: json!({"text": format!("payload {id}"), "thread_id": thread_id}),
    }
}

async fn sqlite_store() -> (TempDir, SqliteChatStore) {
    let dir = TempDir::new().expect("tempdir");
    let backend = SqliteBackend::connect(&dir.path().join("chat.db"))
        .await
        .expect("connect");
    (dir, SqliteChatStore::new(backend))
}

async fn assert_marker_isolation(store: &dyn ChatStore) {
    store.add_thread_item("t1", item("m0", "t1")).await.expect("add");
    store.add_thread_item("t1", item("m1", "t1")).await.expect("add");
    store.add_thread_item("t2", item("n0", "t2")).await.expect("add");
    store.add_thread_item("t2", item("n1", "t2")).await.expect("add");

    // a marker from another thread never resolves; the page restarts
    let page = store
        .load_thread_items("t1", Some("n0"), 10, SortOrder::Asc)
        .await
        .expect("load");
    let ids: Vec<&str> = page.data.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, vec!["m0", "m1"]);

    let page = store
        .load_thread_items("t1", Some("m0"), 10, SortOrder::Asc)
        .await
        .expect("load");
    let ids: Vec<&str> = page.data.iter().map(|item| item.id.as_str()).collect();
    assert_eq!(ids, vec!["m1"]);
}

#[tokio::test]
async fn in_memory_markers_never_cross_threads() {
    let store = InMemoryChatStore::new();
    assert_marker_isolation(&store).await;
}

#[tokio::test]
async fn sqlite_markers_never_cross_threads() {
    let (_dir, store) = sqlite_store().await;
    assert_marker_isolation(&store).await;
}

#[tokio::test]
async fn thread_pagination_uses_keyset_order() {
    let (_dir, store) = sqlite_store().await;
    for n in 0..5 {
        let mut thread = ThreadMetadata::new(&format!("thread-{n}"));
        thread.created_at = Utc::now() + Duration::seconds(n);
        thread.updated_at = thread.created_at;
        store.save_thread(thread).await.expect("save");
    }
    let first = store
        .load_threads(2, None, SortOrder::Asc)
        .await
        .expect("page");
    assert_eq!(first.data.len(), 2);
    assert!(first.has_more);
    let marker = first.after.expect("marker");
    let second = store
        .load_threads(10, Some(&marker), SortOrder::Asc)
        .await
        .expect("page");
    assert_eq!(second.data.len(), 3);
    assert!(!second.has_more);
    let newest = store
        .load_threads(1, None, SortOrder::Desc)
        .await
        .expect("page");
    assert_eq!(newest.data[0].id, "thread-4");
}

#[tokio::test]
async fn save_item_upserts_and_keeps_ordinal() {
    let (_dir, store) = sqlite_store().await;
    let stored = store.add_thread_item("t1", item("m0", "t1")).await.expect("add");
    let mut updated = item("m0", "t1");
    updated.payload = json!({"text": "edited"});
    store.save_item(updated).await.expect("upsert");
    let loaded = store.load_item("t1", "m0").await.expect("load");
    assert_eq!(loaded.ordinal, stored.ordinal);
    assert_eq!(loaded.payload["text"], json!("edited"));
}

#[tokio::test]
async fn search_is_scoped_to_thread_and_substring() {
    let (_dir, store) = sqlite_store().await;
    store.add_thread_item("t1", item("alpha", "t1")).await.expect("add");
    store.add_thread_item("t1", item("beta", "t1")).await.expect("add");
    store.add_thread_item("t2", item("alpha-2", "t2")).await.expect("add");
    let page = store
        .search_thread_items("t1", "alpha", None, 10)
        .await
        .expect("search");
    assert_eq!(page.data.len(), 1);
    assert_eq!(page.data[0].id, "alpha");
}

#[tokio::test]
async fn prune_cascades_items_and_counts_threads() {
    let (_dir, store) = sqlite_store().await;
    store.add_thread_item("old", item("m0", "old")).await.expect("add");
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    let cutoff = Utc::now();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    store.add_thread_item("fresh", item("m1", "fresh")).await.expect("add");

    let pruned = store.prune_threads_older_than(cutoff).await.expect("prune");
    assert_eq!(pruned, 1);
    assert!(store.load_thread("old").await.is_err());
    assert!(store.load_thread("fresh").await.is_ok());
    assert!(store.load_item("old", "m0").await.is_err());
}

#[tokio::test]
async fn legacy_chat_messages_gain_thread_id_with_backfill() {
    let dir = TempDir::new().expect("tempdir");
    let path = dir.path().join("legacy.db");

    // Seed a pre-migration schema: chat_messages without thread_id.
    {
        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .expect("seed pool");
        sqlx::query(
            "CREATE TABLE chat_messages (
                id TEXT PRIMARY KEY,
                ordinal INTEGER NOT NULL,
                item_type TEXT NOT NULL,
                item_json TEXT NOT NULL,
                created_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await
        .expect("create legacy table");
        sqlx::query(
            "INSERT INTO chat_messages (id, ordinal, item_type, item_json, created_at)
             VALUES ('m0', 0, 'message', '{\"thread_id\":\"t1\",\"text\":\"hi\"}', '2026-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .expect("seed row");
        pool.close().await;
    }

    let backend = SqliteBackend::connect(&path).await.expect("connect");
    let store = SqliteChatStore::new(backend);
    // Any operation initialises the schema and runs the migration.
    store
        .save_thread(ThreadMetadata::new("t1"))
        .await
        .expect("save thread");

    let verify_pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(&path))
        .await
        .expect("verify pool");
    let row = sqlx::query("SELECT thread_id FROM chat_messages WHERE id = 'm0'")
        .fetch_one(&verify_pool)
        .await
        .expect("fetch migrated row");
    let thread_id: String = row.try_get("thread_id").expect("column exists");
    assert_eq!(thread_id, "t1");
    verify_pool.close().await;

    let loaded = store.load_item("t1", "m0").await.expect("load");
    assert_eq!(loaded.payload["text"], json!("hi"));
}

#[tokio::test]
async fn in_memory_attachments_are_unsupported() {
    let store = InMemoryChatStore::new();
    let attachment = orcheo_types::ChatAttachment {
        id: "a1".to_string(),
        thread_id: Some("t1".to_string()),
        attachment_type: "file".to_string(),
        name: "notes.txt".to_string(),
        mime_type: "text/plain".to_string(),
        details: json!({}),
        storage_path: None,
        created_at: Utc::now(),
    };
    assert!(store.save_attachment(attachment).await.is_err());
}
