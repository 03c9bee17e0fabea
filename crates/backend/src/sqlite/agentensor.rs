use super::{db_err, decode_json, decode_ts, encode_json, encode_ts, SqliteBackend};
use crate::store::{AgentensorCheckpointStore, RecordCheckpointParams};
use async_trait::async_trait;
use orcheo_types::{AgentensorCheckpoint, OrcheoError};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// SQLite-backed checkpoint store shared across backend workers.
pub struct SqliteAgentensorCheckpointStore {
    backend: SqliteBackend,
}

impl SqliteAgentensorCheckpointStore {
    pub fn new(backend: SqliteBackend) -> Self {
        SqliteAgentensorCheckpointStore { backend }
    }
}

fn row_to_checkpoint(row: &SqliteRow) -> Result<AgentensorCheckpoint, OrcheoError> {
    let runnable_config: String = row.try_get("runnable_config").map_err(db_err)?;
    let metrics: String = row.try_get("metrics").map_err(db_err)?;
    let metadata: String = row.try_get("metadata").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    Ok(AgentensorCheckpoint {
        id: row.try_get("id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        config_version: row.try_get("config_version").map_err(db_err)?,
        runnable_config: decode_json(&runnable_config)?,
        metrics: decode_json(&metrics)?,
        metadata: decode_json(&metadata)?,
        artifact_url: row.try_get("artifact_url").map_err(db_err)?,
        is_best: row.try_get("is_best").map_err(db_err)?,
        created_at: decode_ts(&created_at)?,
    })
}

#[async_trait]
impl AgentensorCheckpointStore for SqliteAgentensorCheckpointStore {
    async fn record_checkpoint(
        &self,
        params: RecordCheckpointParams,
    ) -> Result<AgentensorCheckpoint, OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let version = match params.config_version {
            Some(version) => version,
            None => {
                let max: i64 = sqlx::query(
                    "SELECT COALESCE(MAX(config_version), 0) AS max_version
                       FROM agentensor_checkpoints WHERE workflow_id = ?",
                )
                .bind(&params.workflow_id)
                .fetch_one(&mut *tx)
                .await
                .map_err(db_err)?
                .try_get("max_version")
                .map_err(db_err)?;
                max + 1
            }
        };
        let checkpoint = AgentensorCheckpoint::new(
            &params.workflow_id,
            version,
            params.runnable_config,
            params.metrics,
            params.metadata,
            params.artifact_url,
            params.is_best,
        );
        sqlx::query(
            "INSERT INTO agentensor_checkpoints (
                id, workflow_id, config_version, runnable_config, metrics, metadata,
                artifact_url, is_best, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.workflow_id)
        .bind(checkpoint.config_version)
        .bind(encode_json(&checkpoint.runnable_config)?)
        .bind(encode_json(&checkpoint.metrics)?)
        .bind(encode_json(&checkpoint.metadata)?)
        .bind(&checkpoint.artifact_url)
        .bind(checkpoint.is_best)
        .bind(encode_ts(&checkpoint.created_at))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if checkpoint.is_best {
            sqlx::query(
                "UPDATE agentensor_checkpoints SET is_best = 0
                  WHERE workflow_id = ? AND id != ?",
            )
            .bind(&checkpoint.workflow_id)
            .bind(&checkpoint.id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        }
        tx.commit().await.map_err(db_err)?;
        Ok(checkpoint)
    }

    async fn list_checkpoints(
        &self,
        workflow_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<AgentensorCheckpoint>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let mut query = String::from(
            "SELECT * FROM agentensor_checkpoints WHERE workflow_id = ?
              ORDER BY config_version DESC",
        );
        if limit.is_some() {
            query.push_str(" LIMIT ?");
        }
        let mut prepared = sqlx::query(&query).bind(workflow_id);
        if let Some(limit) = limit {
            prepared = prepared.bind(limit.max(0));
        }
        let rows = prepared
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<AgentensorCheckpoint, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM agentensor_checkpoints WHERE id = ?")
            .bind(checkpoint_id)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("checkpoint", checkpoint_id))?;
        row_to_checkpoint(&row)
    }

    async fn latest_checkpoint(
        &self,
        workflow_id: &str,
    ) -> Result<Option<AgentensorCheckpoint>, OrcheoError> {
        Ok(self
            .list_checkpoints(workflow_id, Some(1))
            .await?
            .into_iter()
            .next())
    }
}
