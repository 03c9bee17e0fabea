//! Chat service over the pluggable chat store: inbound-context metadata
//! merge, the non-authoritative per-thread runs mirror, and the
//! retention loop.

use chrono::{DateTime, Utc};
use orcheo_backend::ChatStore;
use orcheo_types::{
    ChatAttachment, OrcheoError, Page, SortOrder, ThreadItem, ThreadMetadata,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Most recent runs remembered on a thread's metadata. A convenience
/// mirror for chat UIs; the repository's run list stays authoritative.
pub const RUNS_MIRROR_LIMIT: usize = 20;

/// Request context merged into thread metadata on save.
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    pub workflow_id: Option<String>,
    pub workflow_name: Option<String>,
}

/// Façade over the chat store used by interactive executions.
pub struct ChatService {
    store: Arc<dyn ChatStore>,
}

impl ChatService {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        ChatService { store }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    /// Upsert a thread, merging the request context into its metadata
    /// without overwriting explicitly set fields.
    pub async fn save_thread(
        &self,
        mut thread: ThreadMetadata,
        context: &ChatContext,
    ) -> Result<(), OrcheoError> {
        if !thread.metadata.is_object() {
            thread.metadata = json!({});
        }
        if let Some(metadata) = thread.metadata.as_object_mut() {
            if let Some(workflow_id) = &context.workflow_id {
                metadata
                    .entry("workflow_id".to_string())
                    .or_insert_with(|| json!(workflow_id));
            }
            if let Some(workflow_name) = &context.workflow_name {
                metadata
                    .entry("workflow_name".to_string())
                    .or_insert_with(|| json!(workflow_name));
            }
        }
        thread.updated_at = Utc::now();
        self.store.save_thread(thread).await
    }

    pub async fn load_thread(&self, thread_id: &str) -> Result<ThreadMetadata, OrcheoError> {
        self.store.load_thread(thread_id).await
    }

    pub async fn load_threads(
        &self,
        limit: i64,
        after: Option<&str>,
        order: SortOrder,
    ) -> Result<Page<ThreadMetadata>, OrcheoError> {
        self.store.load_threads(limit, after, order).await
    }

    pub async fn delete_thread(&self, thread_id: &str) -> Result<(), OrcheoError> {
        self.store.delete_thread(thread_id).await
    }

    pub async fn add_thread_item(
        &self,
        thread_id: &str,
        item: ThreadItem,
    ) -> Result<ThreadItem, OrcheoError> {
        self.store.add_thread_item(thread_id, item).await
    }

    pub async fn save_item(&self, item: ThreadItem) -> Result<(), OrcheoError> {
        self.store.save_item(item).await
    }

    pub async fn load_thread_items(
        &self,
        thread_id: &str,
        after: Option<&str>,
        limit: i64,
        order: SortOrder,
    ) -> Result<Page<ThreadItem>, OrcheoError> {
        self.store
            .load_thread_items(thread_id, after, limit, order)
            .await
    }

    pub async fn search_thread_items(
        &self,
        thread_id: &str,
        query: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Page<ThreadItem>, OrcheoError> {
        self.store
            .search_thread_items(thread_id, query, after, limit)
            .await
    }

    pub async fn save_attachment(&self, attachment: ChatAttachment) -> Result<(), OrcheoError> {
        self.store.save_attachment(attachment).await
    }

    pub async fn load_attachment(
        &self,
        attachment_id: &str,
    ) -> Result<ChatAttachment, OrcheoError> {
        self.store.load_attachment(attachment_id).await
    }

    pub async fn delete_attachment(&self, attachment_id: &str) -> Result<(), OrcheoError> {
        self.store.delete_attachment(attachment_id).await
    }

    /// Record an execution on the thread's `runs` mirror: deduped,
    /// newest last, capped at `RUNS_MIRROR_LIMIT`.
    pub async fn record_run_for_thread(
        &self,
        thread_id: &str,
        execution_id: &str,
    ) -> Result<(), OrcheoError> {
        let mut thread = self.store.load_thread(thread_id).await?;
        if !thread.metadata.is_object() {
            thread.metadata = json!({});
        }
        if let Some(metadata) = thread.metadata.as_object_mut() {
            let mut runs: Vec<String> = metadata
                .get("runs")
                .and_then(Value::as_array)
                .map(|entries| {
                    entries
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default();
            runs.retain(|existing| existing != execution_id);
            runs.push(execution_id.to_string());
            if runs.len() > RUNS_MIRROR_LIMIT {
                let overflow = runs.len() - RUNS_MIRROR_LIMIT;
                runs.drain(0..overflow);
            }
            metadata.insert("runs".to_string(), json!(runs));
        }
        thread.updated_at = Utc::now();
        self.store.save_thread(thread).await
    }

    pub async fn prune_threads_older_than(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<u64, OrcheoError> {
        self.store.prune_threads_older_than(cutoff).await
    }

    /// Background retention loop: periodically prune threads older than
    /// the retention window.
    pub fn spawn_retention_loop(
        self: &Arc<Self>,
        retention: Duration,
        interval: Duration,
    ) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = Utc::now()
                    - chrono::Duration::from_std(retention)
                        .unwrap_or_else(|_| chrono::Duration::days(30));
                match service.prune_threads_older_than(cutoff).await {
                    Ok(0) => {}
                    Ok(pruned) => tracing::info!(pruned, "pruned stale chat threads"),
                    Err(err) => tracing::warn!(error = %err, "chat retention pass failed"),
                }
            }
        })
    }
}
