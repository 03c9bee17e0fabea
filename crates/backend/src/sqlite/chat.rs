use super::{db_err, decode_json, decode_ts, encode_json, encode_ts, SqliteBackend};
use crate::store::ChatStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orcheo_types::{ChatAttachment, OrcheoError, Page, SortOrder, ThreadItem, ThreadMetadata};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

/// Chat storage persisted across `chat_threads`, `chat_messages`, and
/// `chat_attachments`.
pub struct SqliteChatStore {
    backend: SqliteBackend,
}

impl SqliteChatStore {
    pub fn new(backend: SqliteBackend) -> Self {
        SqliteChatStore { backend }
    }

    /// Resolve a pagination marker strictly inside the given thread.
    async fn resolve_marker(
        &self,
        thread_id: &str,
        marker: &str,
    ) -> Result<Option<i64>, OrcheoError> {
        let row = sqlx::query("SELECT ordinal FROM chat_messages WHERE id = ? AND thread_id = ?")
            .bind(marker)
            .bind(thread_id)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?;
        row.map(|row| row.try_get::<i64, _>("ordinal").map_err(db_err))
            .transpose()
    }

    async fn cascade_delete_thread(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        thread_id: &str,
    ) -> Result<Vec<String>, OrcheoError> {
        let paths: Vec<String> = sqlx::query(
            "SELECT storage_path FROM chat_attachments
              WHERE thread_id = ? AND storage_path IS NOT NULL",
        )
        .bind(thread_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .filter_map(|row| row.try_get::<Option<String>, _>("storage_path").ok().flatten())
        .collect();
        sqlx::query("DELETE FROM chat_messages WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chat_attachments WHERE thread_id = ?")
            .bind(thread_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chat_threads WHERE id = ?")
            .bind(thread_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        Ok(paths)
    }
}

fn remove_blobs(paths: &[String]) {
    for path in paths {
        if let Err(err) = std::fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path, error = %err, "failed to remove attachment blob");
            }
        }
    }
}

fn row_to_thread(row: &SqliteRow) -> Result<ThreadMetadata, OrcheoError> {
    let status_json: String = row.try_get("status_json").map_err(db_err)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let updated_at: String = row.try_get("updated_at").map_err(db_err)?;
    Ok(ThreadMetadata {
        id: row.try_get("id").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        created_at: decode_ts(&created_at)?,
        updated_at: decode_ts(&updated_at)?,
        status: decode_json(&status_json)?,
        metadata: decode_json(&metadata_json)?,
    })
}

fn row_to_item(row: &SqliteRow) -> Result<ThreadItem, OrcheoError> {
    let item_json: String = row.try_get("item_json").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    Ok(ThreadItem {
        id: row.try_get("id").map_err(db_err)?,
        thread_id: row.try_get("thread_id").map_err(db_err)?,
        ordinal: row.try_get("ordinal").map_err(db_err)?,
        item_type: row.try_get("item_type").map_err(db_err)?,
        created_at: decode_ts(&created_at)?,
        payload: decode_json(&item_json)?,
    })
}

fn row_to_attachment(row: &SqliteRow) -> Result<ChatAttachment, OrcheoError> {
    let details_json: String = row.try_get("details_json").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    Ok(ChatAttachment {
        id: row.try_get("id").map_err(db_err)?,
        thread_id: row.try_get("thread_id").map_err(db_err)?,
        attachment_type: row.try_get("attachment_type").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        mime_type: row.try_get("mime_type").map_err(db_err)?,
        details: decode_json(&details_json)?,
        storage_path: row.try_get("storage_path").map_err(db_err)?,
        created_at: decode_ts(&created_at)?,
    })
}

fn page_from_rows(rows: Vec<ThreadItem>, limit: i64) -> Page<ThreadItem> {
    let limit = limit.max(0) as usize;
    let has_more = rows.len() > limit;
    let data: Vec<ThreadItem> = rows.into_iter().take(limit).collect();
    let after = if has_more {
        data.last().map(|item| item.id.clone())
    } else {
        None
    };
    Page {
        data,
        has_more,
        after,
    }
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn save_thread(&self, thread: ThreadMetadata) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        sqlx::query(
            "INSERT INTO chat_threads (id, title, status_json, metadata_json, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT (id) DO UPDATE SET
                title = excluded.title,
                status_json = excluded.status_json,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at",
        )
        .bind(&thread.id)
        .bind(&thread.title)
        .bind(encode_json(&thread.status)?)
        .bind(encode_json(&thread.metadata)?)
        .bind(encode_ts(&thread.created_at))
        .bind(encode_ts(&thread.updated_at))
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_thread(&self, thread_id: &str) -> Result<ThreadMetadata, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM chat_threads WHERE id = ?")
            .bind(thread_id)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("thread", thread_id))?;
        row_to_thread(&row)
    }

    async fn load_threads(
        &self,
        limit: i64,
        after: Option<&str>,
        order: SortOrder,
    ) -> Result<Page<ThreadMetadata>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let marker = match after {
            Some(marker) => sqlx::query("SELECT created_at, id FROM chat_threads WHERE id = ?")
                .bind(marker)
                .fetch_optional(self.backend.pool())
                .await
                .map_err(db_err)?,
            None => None,
        };
        let limit = limit.max(0);
        let rows = match (&marker, order) {
            (Some(row), SortOrder::Asc) => {
                let created_at: String = row.try_get("created_at").map_err(db_err)?;
                let id: String = row.try_get("id").map_err(db_err)?;
                sqlx::query(
                    "SELECT * FROM chat_threads
                      WHERE (created_at > ?) OR (created_at = ? AND id > ?)
                      ORDER BY created_at, id LIMIT ?",
                )
                .bind(&created_at)
                .bind(&created_at)
                .bind(&id)
                .bind(limit + 1)
                .fetch_all(self.backend.pool())
                .await
            }
            (Some(row), SortOrder::Desc) => {
                let created_at: String = row.try_get("created_at").map_err(db_err)?;
                let id: String = row.try_get("id").map_err(db_err)?;
                sqlx::query(
                    "SELECT * FROM chat_threads
                      WHERE (created_at < ?) OR (created_at = ? AND id < ?)
                      ORDER BY created_at DESC, id DESC LIMIT ?",
                )
                .bind(&created_at)
                .bind(&created_at)
                .bind(&id)
                .bind(limit + 1)
                .fetch_all(self.backend.pool())
                .await
            }
            (None, SortOrder::Asc) => {
                sqlx::query("SELECT * FROM chat_threads ORDER BY created_at, id LIMIT ?")
                    .bind(limit + 1)
                    .fetch_all(self.backend.pool())
                    .await
            }
            (None, SortOrder::Desc) => {
                sqlx::query("SELECT * FROM chat_threads ORDER BY created_at DESC, id DESC LIMIT ?")
                    .bind(limit + 1)
                    .fetch_all(self.backend.pool())
                    .await
            }
        }
        .map_err(db_err)?;
        let mut threads = rows
            .iter()
            .map(row_to_thread)
            .collect::<Result<Vec<_>, _>>()?;
        let has_more = threads.len() > limit as usize;
        threads.truncate(limit as usize);
        let after = if has_more {
            threads.last().map(|thread| thread.id.clone())
        } else {
            None
        };
        Ok(Page {
            data: threads,
            has_more,
            after,
        })
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let paths = self.cascade_delete_thread(&mut tx, thread_id).await?;
        tx.commit().await.map_err(db_err)?;
        remove_blobs(&paths);
        Ok(())
    }

    async fn add_thread_item(
        &self,
        thread_id: &str,
        mut item: ThreadItem,
    ) -> Result<ThreadItem, OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT OR IGNORE INTO chat_threads (id, status_json, metadata_json, created_at, updated_at)
             VALUES (?, '{}', '{}', ?, ?)",
        )
        .bind(thread_id)
        .bind(encode_ts(&now))
        .bind(encode_ts(&now))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) AS next
               FROM chat_messages WHERE thread_id = ?",
        )
        .bind(thread_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .try_get("next")
        .map_err(db_err)?;
        item.thread_id = thread_id.to_string();
        item.ordinal = next;
        sqlx::query(
            "INSERT INTO chat_messages (id, thread_id, ordinal, item_type, item_json, created_at)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&item.id)
        .bind(&item.thread_id)
        .bind(item.ordinal)
        .bind(&item.item_type)
        .bind(encode_json(&item.payload)?)
        .bind(encode_ts(&item.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("UPDATE chat_threads SET updated_at = ? WHERE id = ?")
            .bind(encode_ts(&now))
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(item)
    }

    async fn save_item(&self, item: ThreadItem) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        let existing = self
            .resolve_marker(&item.thread_id, &item.id)
            .await?;
        match existing {
            Some(ordinal) => {
                let _writer = self.backend.writer().lock().await;
                sqlx::query(
                    "UPDATE chat_messages SET item_type = ?, item_json = ?
                      WHERE id = ? AND thread_id = ? AND ordinal = ?",
                )
                .bind(&item.item_type)
                .bind(encode_json(&item.payload)?)
                .bind(&item.id)
                .bind(&item.thread_id)
                .bind(ordinal)
                .execute(self.backend.pool())
                .await
                .map_err(db_err)?;
                Ok(())
            }
            None => {
                let thread_id = item.thread_id.clone();
                self.add_thread_item(&thread_id, item).await.map(|_| ())
            }
        }
    }

    async fn load_item(&self, thread_id: &str, item_id: &str) -> Result<ThreadItem, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM chat_messages WHERE id = ? AND thread_id = ?")
            .bind(item_id)
            .bind(thread_id)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("thread item", item_id))?;
        row_to_item(&row)
    }

    async fn load_thread_items(
        &self,
        thread_id: &str,
        after: Option<&str>,
        limit: i64,
        order: SortOrder,
    ) -> Result<Page<ThreadItem>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let marker_ordinal = match after {
            Some(marker) => self.resolve_marker(thread_id, marker).await?,
            None => None,
        };
        let limit = limit.max(0);
        let rows = match (marker_ordinal, order) {
            (Some(ordinal), SortOrder::Asc) => sqlx::query(
                "SELECT * FROM chat_messages WHERE thread_id = ? AND ordinal > ?
                  ORDER BY ordinal LIMIT ?",
            )
            .bind(thread_id)
            .bind(ordinal)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            (Some(ordinal), SortOrder::Desc) => sqlx::query(
                "SELECT * FROM chat_messages WHERE thread_id = ? AND ordinal < ?
                  ORDER BY ordinal DESC LIMIT ?",
            )
            .bind(thread_id)
            .bind(ordinal)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            (None, SortOrder::Asc) => sqlx::query(
                "SELECT * FROM chat_messages WHERE thread_id = ? ORDER BY ordinal LIMIT ?",
            )
            .bind(thread_id)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            (None, SortOrder::Desc) => sqlx::query(
                "SELECT * FROM chat_messages WHERE thread_id = ? ORDER BY ordinal DESC LIMIT ?",
            )
            .bind(thread_id)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
        }
        .map_err(db_err)?;
        let items = rows.iter().map(row_to_item).collect::<Result<Vec<_>, _>>()?;
        Ok(page_from_rows(items, limit))
    }

    async fn search_thread_items(
        &self,
        thread_id: &str,
        query: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Page<ThreadItem>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let marker_ordinal = match after {
            Some(marker) => self.resolve_marker(thread_id, marker).await?,
            None => None,
        };
        let limit = limit.max(0);
        let pattern = format!("%{query}%");
        let rows = match marker_ordinal {
            Some(ordinal) => sqlx::query(
                "SELECT * FROM chat_messages
                  WHERE thread_id = ? AND ordinal > ? AND item_json LIKE ?
                  ORDER BY ordinal LIMIT ?",
            )
            .bind(thread_id)
            .bind(ordinal)
            .bind(&pattern)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            None => sqlx::query(
                "SELECT * FROM chat_messages
                  WHERE thread_id = ? AND item_json LIKE ?
                  ORDER BY ordinal LIMIT ?",
            )
            .bind(thread_id)
            .bind(&pattern)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
        }
        .map_err(db_err)?;
        let items = rows.iter().map(row_to_item).collect::<Result<Vec<_>, _>>()?;
        Ok(page_from_rows(items, limit))
    }

    async fn prune_threads_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let stale: Vec<String> = sqlx::query("SELECT id FROM chat_threads WHERE updated_at < ?")
            .bind(encode_ts(&cutoff))
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err)?
            .into_iter()
            .filter_map(|row| row.try_get::<String, _>("id").ok())
            .collect();
        let mut all_paths = Vec::new();
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        for thread_id in &stale {
            let mut paths = self.cascade_delete_thread(&mut tx, thread_id).await?;
            all_paths.append(&mut paths);
        }
        tx.commit().await.map_err(db_err)?;
        remove_blobs(&all_paths);
        Ok(stale.len() as u64)
    }

    async fn save_attachment(&self, attachment: ChatAttachment) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        sqlx::query(
            "INSERT INTO chat_attachments (
                id, thread_id, attachment_type, name, mime_type, details_json,
                storage_path, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                thread_id = excluded.thread_id,
                attachment_type = excluded.attachment_type,
                name = excluded.name,
                mime_type = excluded.mime_type,
                details_json = excluded.details_json,
                storage_path = excluded.storage_path",
        )
        .bind(&attachment.id)
        .bind(&attachment.thread_id)
        .bind(&attachment.attachment_type)
        .bind(&attachment.name)
        .bind(&attachment.mime_type)
        .bind(encode_json(&attachment.details)?)
        .bind(&attachment.storage_path)
        .bind(encode_ts(&attachment.created_at))
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_attachment(&self, attachment_id: &str) -> Result<ChatAttachment, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM chat_attachments WHERE id = ?")
            .bind(attachment_id)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("attachment", attachment_id))?;
        row_to_attachment(&row)
    }

    async fn delete_attachment(&self, attachment_id: &str) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let path: Option<String> = sqlx::query(
            "SELECT storage_path FROM chat_attachments WHERE id = ?",
        )
        .bind(attachment_id)
        .fetch_optional(self.backend.pool())
        .await
        .map_err(db_err)?
        .and_then(|row| row.try_get::<Option<String>, _>("storage_path").ok().flatten());
        let result = sqlx::query("DELETE FROM chat_attachments WHERE id = ?")
            .bind(attachment_id)
            .execute(self.backend.pool())
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(OrcheoError::not_found("attachment", attachment_id));
        }
        if let Some(path) = path {
            remove_blobs(&[path]);
        }
        Ok(())
    }
}
