//! Conversational storage entities: threads, items, attachments.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Pagination order for keyset queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        }
    }
}

/// One page of results plus a continuation marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub has_more: bool,
    pub after: Option<String>,
}

impl<T> Page<T> {
    pub fn empty() -> Self {
        Page {
            data: Vec::new(),
            has_more: false,
            after: None,
        }
    }
}

/// Thread header; items are stored separately and paginated by ordinal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadMetadata {
    pub id: String,
    pub title: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default = "empty_object")]
    pub status: Value,
    #[serde(default = "empty_object")]
    pub metadata: Value,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl ThreadMetadata {
    pub fn new(id: &str) -> Self {
        let now = Utc::now();
        ThreadMetadata {
            id: id.to_string(),
            title: None,
            created_at: now,
            updated_at: now,
            status: empty_object(),
            metadata: empty_object(),
        }
    }
}

/// Item inside a thread. The `(thread_id, ordinal)` pair is unique and
/// assigned monotonically per thread.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadItem {
    pub id: String,
    pub thread_id: String,
    pub ordinal: i64,
    pub item_type: String,
    pub created_at: DateTime<Utc>,
    pub payload: Value,
}

/// Attachment metadata; blob storage paths are opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatAttachment {
    pub id: String,
    pub thread_id: Option<String>,
    pub attachment_type: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default = "empty_object")]
    pub details: Value,
    pub storage_path: Option<String>,
    pub created_at: DateTime<Utc>,
}
