use crate::store::ChatStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orcheo_types::{ChatAttachment, OrcheoError, Page, SortOrder, ThreadItem, ThreadMetadata};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct ChatState {
    threads: HashMap<String, ThreadMetadata>,
    items: HashMap<String, Vec<ThreadItem>>,
}

/// Chat store backed by process-local maps. Attachments are declared
/// unsupported here; persistent backends handle them.
#[derive(Default)]
pub struct InMemoryChatStore {
    state: Mutex<ChatState>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate_items(
    mut items: Vec<ThreadItem>,
    thread_id: &str,
    after: Option<&str>,
    limit: i64,
    order: SortOrder,
) -> Page<ThreadItem> {
    items.sort_by_key(|item| item.ordinal);
    if order == SortOrder::Desc {
        items.reverse();
    }
    // Markers resolve only inside this thread; an unknown marker starts
    // the page from the beginning.
    let start = after
        .and_then(|marker| {
            items
                .iter()
                .position(|item| item.id == marker && item.thread_id == thread_id)
        })
        .map(|position| position + 1)
        .unwrap_or(0);
    let limit = limit.max(0) as usize;
    let window: Vec<ThreadItem> = items.into_iter().skip(start).collect();
    let has_more = window.len() > limit;
    let data: Vec<ThreadItem> = window.into_iter().take(limit).collect();
    let next_after = if has_more {
        data.last().map(|item| item.id.clone())
    } else {
        None
    };
    Page {
        data,
        has_more,
        after: next_after,
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    async fn save_thread(&self, thread: ThreadMetadata) -> Result<(), OrcheoError> {
        let mut state = self.state.lock().await;
        state.items.entry(thread.id.clone()).or_default();
        state.threads.insert(thread.id.clone(), thread);
        Ok(())
    }

    async fn load_thread(&self, thread_id: &str) -> Result<ThreadMetadata, OrcheoError> {
        let state = self.state.lock().await;
        state
            .threads
            .get(thread_id)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("thread", thread_id))
    }

    async fn load_threads(
        &self,
        limit: i64,
        after: Option<&str>,
        order: SortOrder,
    ) -> Result<Page<ThreadMetadata>, OrcheoError> {
        let state = self.state.lock().await;
        let mut threads: Vec<ThreadMetadata> = state.threads.values().cloned().collect();
        threads.sort_by(|a, b| (a.created_at, a.id.clone()).cmp(&(b.created_at, b.id.clone())));
        if order == SortOrder::Desc {
            threads.reverse();
        }
        let start = after
            .and_then(|marker| threads.iter().position(|thread| thread.id == marker))
            .map(|position| position + 1)
            .unwrap_or(0);
        let limit = limit.max(0) as usize;
        let window: Vec<ThreadMetadata> = threads.into_iter().skip(start).collect();
        let has_more = window.len() > limit;
        let data: Vec<ThreadMetadata> = window.into_iter().take(limit).collect();
        let next_after = if has_more {
            data.last().map(|thread| thread.id.clone())
        } else {
            None
        };
        Ok(Page {
            data,
            has_more,
            after: next_after,
        })
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), OrcheoError> {
        let mut state = self.state.lock().await;
        state.threads.remove(thread_id);
        state.items.remove(thread_id);
        Ok(())
    }

    async fn add_thread_item(
        &self,
        thread_id: &str,
        mut item: ThreadItem,
    ) -> Result<ThreadItem, OrcheoError> {
        let mut state = self.state.lock().await;
        if !state.threads.contains_key(thread_id) {
            let thread = ThreadMetadata::new(thread_id);
            state.threads.insert(thread_id.to_string(), thread);
        }
        let items = state.items.entry(thread_id.to_string()).or_default();
        let next_ordinal = items.iter().map(|item| item.ordinal + 1).max().unwrap_or(0);
        item.thread_id = thread_id.to_string();
        item.ordinal = next_ordinal;
        items.push(item.clone());
        if let Some(thread) = state.threads.get_mut(thread_id) {
            thread.updated_at = Utc::now();
        }
        Ok(item)
    }

    async fn save_item(&self, item: ThreadItem) -> Result<(), OrcheoError> {
        let mut state = self.state.lock().await;
        let items = state.items.entry(item.thread_id.clone()).or_default();
        match items.iter_mut().find(|existing| existing.id == item.id) {
            Some(existing) => {
                let ordinal = existing.ordinal;
                *existing = item;
                existing.ordinal = ordinal;
            }
            None => {
                let next_ordinal = items.iter().map(|item| item.ordinal + 1).max().unwrap_or(0);
                let mut item = item;
                item.ordinal = next_ordinal;
                items.push(item);
            }
        }
        Ok(())
    }

    async fn load_item(&self, thread_id: &str, item_id: &str) -> Result<ThreadItem, OrcheoError> {
        let state = self.state.lock().await;
        state
            .items
            .get(thread_id)
            .into_iter()
            .flatten()
            .find(|item| item.id == item_id)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("thread item", item_id))
    }

    async fn load_thread_items(
        &self,
        thread_id: &str,
        after: Option<&str>,
        limit: i64,
        order: SortOrder,
    ) -> Result<Page<ThreadItem>, OrcheoError> {
        let state = self.state.lock().await;
        let items = state.items.get(thread_id).cloned().unwrap_or_default();
        Ok(paginate_items(items, thread_id, after, limit, order))
    }

    async fn search_thread_items(
        &self,
        thread_id: &str,
        query: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Page<ThreadItem>, OrcheoError> {
        let state = self.state.lock().await;
        let matching: Vec<ThreadItem> = state
            .items
            .get(thread_id)
            .into_iter()
            .flatten()
            .filter(|item| {
                serde_json::to_string(&item.payload)
                    .map(|serialized| serialized.contains(query))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        Ok(paginate_items(
            matching,
            thread_id,
            after,
            limit,
            SortOrder::Asc,
        ))
    }

    async fn prune_threads_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, OrcheoError> {
        let mut state = self.state.lock().await;
        let stale: Vec<String> = state
            .threads
            .values()
            .filter(|thread| thread.updated_at < cutoff)
            .map(|thread| thread.id.clone())
            .collect();
        for thread_id in &stale {
            state.threads.remove(thread_id);
            state.items.remove(thread_id);
        }
        Ok(stale.len() as u64)
    }

    async fn save_attachment(&self, _attachment: ChatAttachment) -> Result<(), OrcheoError> {
        Err(OrcheoError::Validation(
            "the in-memory chat store does not persist attachments".to_string(),
        ))
    }

    async fn load_attachment(&self, attachment_id: &str) -> Result<ChatAttachment, OrcheoError> {
        Err(OrcheoError::not_found("attachment", attachment_id))
    }

    async fn delete_attachment(&self, _attachment_id: &str) -> Result<(), OrcheoError> {
        Err(OrcheoError::Validation(
            "the in-memory chat store does not persist attachments".to_string(),
        ))
    }
}
