use super::{db_err, PostgresBackend};
use crate::store::ChatStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orcheo_types::{ChatAttachment, OrcheoError, Page, SortOrder, ThreadItem, ThreadMetadata};
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};

/// Chat storage persisted across `chat_threads`, `chat_messages`, and
/// `chat_attachments`.
pub struct PostgresChatStore {
    backend: PostgresBackend,
}

impl PostgresChatStore {
    pub fn new(backend: PostgresBackend) -> Self {
        PostgresChatStore { backend }
    }

    async fn resolve_marker(
        &self,
        thread_id: &str,
        marker: &str,
    ) -> Result<Option<i64>, OrcheoError> {
        let row = sqlx::query(
            "SELECT ordinal FROM chat_messages WHERE id = $1 AND thread_id = $2",
        )
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
        tx: &mut Transaction<'_, Postgres>,
        thread_id: &str,
    ) -> Result<Vec<String>, OrcheoError> {
        let paths: Vec<String> = sqlx::query(
            "SELECT storage_path FROM chat_attachments
              WHERE thread_id = $1 AND storage_path IS NOT NULL",
        )
        .bind(thread_id)
        .fetch_all(&mut **tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .filter_map(|row| row.try_get::<Option<String>, _>("storage_path").ok().flatten())
        .collect();
        sqlx::query("DELETE FROM chat_messages WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chat_attachments WHERE thread_id = $1")
            .bind(thread_id)
            .execute(&mut **tx)
            .await
            .map_err(db_err)?;
        sqlx::query("DELETE FROM chat_threads WHERE id = $1")
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

fn row_to_thread(row: &PgRow) -> Result<ThreadMetadata, OrcheoError> {
    Ok(ThreadMetadata {
        id: row.try_get("id").map_err(db_err)?,
        title: row.try_get("title").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        updated_at: row.try_get("updated_at").map_err(db_err)?,
        status: row.try_get("status_json").map_err(db_err)?,
        metadata: row.try_get("metadata_json").map_err(db_err)?,
    })
}

fn row_to_item(row: &PgRow) -> Result<ThreadItem, OrcheoError> {
    Ok(ThreadItem {
        id: row.try_get("id").map_err(db_err)?,
        thread_id: row.try_get("thread_id").map_err(db_err)?,
        ordinal: row.try_get("ordinal").map_err(db_err)?,
        item_type: row.try_get("item_type").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
        payload: row.try_get("item_json").map_err(db_err)?,
    })
}

fn row_to_attachment(row: &PgRow) -> Result<ChatAttachment, OrcheoError> {
    Ok(ChatAttachment {
        id: row.try_get("id").map_err(db_err)?,
        thread_id: row.try_get("thread_id").map_err(db_err)?,
        attachment_type: row.try_get("attachment_type").map_err(db_err)?,
        name: row.try_get("name").map_err(db_err)?,
        mime_type: row.try_get("mime_type").map_err(db_err)?,
        details: row.try_get("details_json").map_err(db_err)?,
        storage_path: row.try_get("storage_path").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
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
impl ChatStore for PostgresChatStore {
    async fn save_thread(&self, thread: ThreadMetadata) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        sqlx::query(
            "INSERT INTO chat_threads (id, title, status_json, metadata_json, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (id) DO UPDATE SET
                title = excluded.title,
                status_json = excluded.status_json,
                metadata_json = excluded.metadata_json,
                updated_at = excluded.updated_at",
        )
        .bind(&thread.id)
        .bind(&thread.title)
        .bind(&thread.status)
        .bind(&thread.metadata)
        .bind(thread.created_at)
        .bind(thread.updated_at)
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_thread(&self, thread_id: &str) -> Result<ThreadMetadata, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM chat_threads WHERE id = $1")
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
        let marker: Option<(DateTime<Utc>, String)> = match after {
            Some(marker) => sqlx::query("SELECT created_at, id FROM chat_threads WHERE id = $1")
                .bind(marker)
                .fetch_optional(self.backend.pool())
                .await
                .map_err(db_err)?
                .map(|row| -> Result<(DateTime<Utc>, String), OrcheoError> {
                    Ok((
                        row.try_get("created_at").map_err(db_err)?,
                        row.try_get("id").map_err(db_err)?,
                    ))
                })
                .transpose()?,
            None => None,
        };
        let limit = limit.max(0);
        let rows = match (&marker, order) {
            (Some((created_at, id)), SortOrder::Asc) => sqlx::query(
                "SELECT * FROM chat_threads
                  WHERE (created_at, id) > ($1, $2)
                  ORDER BY created_at, id LIMIT $3",
            )
            .bind(created_at)
            .bind(id)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            (Some((created_at, id)), SortOrder::Desc) => sqlx::query(
                "SELECT * FROM chat_threads
                  WHERE (created_at, id) < ($1, $2)
                  ORDER BY created_at DESC, id DESC LIMIT $3",
            )
            .bind(created_at)
            .bind(id)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            (None, SortOrder::Asc) => {
                sqlx::query("SELECT * FROM chat_threads ORDER BY created_at, id LIMIT $1")
                    .bind(limit + 1)
                    .fetch_all(self.backend.pool())
                    .await
            }
            (None, SortOrder::Desc) => sqlx::query(
                "SELECT * FROM chat_threads ORDER BY created_at DESC, id DESC LIMIT $1",
            )
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
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
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO chat_threads (id, status_json, metadata_json, created_at, updated_at)
             VALUES ($1, '{}'::jsonb, '{}'::jsonb, $2, $2)
             ON CONFLICT (id) DO NOTHING",
        )
        .bind(thread_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        // Row-level lock so concurrent appends allocate distinct ordinals.
        sqlx::query("SELECT id FROM chat_threads WHERE id = $1 FOR UPDATE")
            .bind(thread_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) AS next
               FROM chat_messages WHERE thread_id = $1",
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
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(&item.id)
        .bind(&item.thread_id)
        .bind(item.ordinal)
        .bind(&item.item_type)
        .bind(&item.payload)
        .bind(item.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("UPDATE chat_threads SET updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(thread_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(item)
    }

    async fn save_item(&self, item: ThreadItem) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        let existing = self.resolve_marker(&item.thread_id, &item.id).await?;
        match existing {
            Some(ordinal) => {
                sqlx::query(
                    "UPDATE chat_messages SET item_type = $1, item_json = $2
                      WHERE id = $3 AND thread_id = $4 AND ordinal = $5",
                )
                .bind(&item.item_type)
                .bind(&item.payload)
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
        let row = sqlx::query("SELECT * FROM chat_messages WHERE id = $1 AND thread_id = $2")
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
                "SELECT * FROM chat_messages WHERE thread_id = $1 AND ordinal > $2
                  ORDER BY ordinal LIMIT $3",
            )
            .bind(thread_id)
            .bind(ordinal)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            (Some(ordinal), SortOrder::Desc) => sqlx::query(
                "SELECT * FROM chat_messages WHERE thread_id = $1 AND ordinal < $2
                  ORDER BY ordinal DESC LIMIT $3",
            )
            .bind(thread_id)
            .bind(ordinal)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            (None, SortOrder::Asc) => sqlx::query(
                "SELECT * FROM chat_messages WHERE thread_id = $1 ORDER BY ordinal LIMIT $2",
            )
            .bind(thread_id)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            (None, SortOrder::Desc) => sqlx::query(
                "SELECT * FROM chat_messages WHERE thread_id = $1 ORDER BY ordinal DESC LIMIT $2",
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
                  WHERE thread_id = $1 AND ordinal > $2 AND item_json::text LIKE $3
                  ORDER BY ordinal LIMIT $4",
            )
            .bind(thread_id)
            .bind(ordinal)
            .bind(&pattern)
            .bind(limit + 1)
            .fetch_all(self.backend.pool())
            .await,
            None => sqlx::query(
                "SELECT * FROM chat_messages
                  WHERE thread_id = $1 AND item_json::text LIKE $2
                  ORDER BY ordinal LIMIT $3",
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
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        // Row locks let a concurrent append to the same thread finish
        // first; its updated_at bump then keeps the thread alive.
        let stale: Vec<String> = sqlx::query(
            "SELECT id FROM chat_threads WHERE updated_at < $1 FOR UPDATE SKIP LOCKED",
        )
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await
        .map_err(db_err)?
        .into_iter()
        .filter_map(|row| row.try_get::<String, _>("id").ok())
        .collect();
        let mut all_paths = Vec::new();
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
        sqlx::query(
            "INSERT INTO chat_attachments (
                id, thread_id, attachment_type, name, mime_type, details_json,
                storage_path, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
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
        .bind(&attachment.details)
        .bind(&attachment.storage_path)
        .bind(attachment.created_at)
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn load_attachment(&self, attachment_id: &str) -> Result<ChatAttachment, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM chat_attachments WHERE id = $1")
            .bind(attachment_id)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("attachment", attachment_id))?;
        row_to_attachment(&row)
    }

    async fn delete_attachment(&self, attachment_id: &str) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        let path: Option<String> = sqlx::query(
            "SELECT storage_path FROM chat_attachments WHERE id = $1",
        )
        .bind(attachment_id)
        .fetch_optional(self.backend.pool())
        .await
        .map_err(db_err)?
        .and_then(|row| row.try_get::<Option<String>, _>("storage_path").ok().flatten());
        let result = sqlx::query("DELETE FROM chat_attachments WHERE id = $1")
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
