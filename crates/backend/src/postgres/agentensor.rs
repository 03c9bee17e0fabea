use super::{db_err, PostgresBackend};
use crate::store::{AgentensorCheckpointStore, RecordCheckpointParams};
use async_trait::async_trait;
use orcheo_types::{AgentensorCheckpoint, OrcheoError};
use sqlx::postgres::PgRow;
use sqlx::Row;

/// Postgres-backed checkpoint store.
pub struct PostgresAgentensorCheckpointStore {
    backend: PostgresBackend,
}

impl PostgresAgentensorCheckpointStore {
    pub fn new(backend: PostgresBackend) -> Self {
        PostgresAgentensorCheckpointStore { backend }
    }
}

fn row_to_checkpoint(row: &PgRow) -> Result<AgentensorCheckpoint, OrcheoError> {
    Ok(AgentensorCheckpoint {
        id: row.try_get("id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        config_version: row.try_get("config_version").map_err(db_err)?,
        runnable_config: row.try_get("runnable_config").map_err(db_err)?,
        metrics: row.try_get("metrics").map_err(db_err)?,
        metadata: row.try_get("metadata").map_err(db_err)?,
        artifact_url: row.try_get("artifact_url").map_err(db_err)?,
        is_best: row.try_get("is_best").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

#[async_trait]
impl AgentensorCheckpointStore for PostgresAgentensorCheckpointStore {
    async fn record_checkpoint(
        &self,
        params: RecordCheckpointParams,
    ) -> Result<AgentensorCheckpoint, OrcheoError> {
        self.backend.ensure_schema().await?;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let version = match params.config_version {
            Some(version) => version,
            None => {
                // FOR UPDATE over the workflow's rows keeps concurrent
                // writers from allocating the same version.
                let max: i64 = sqlx::query(
                    "SELECT COALESCE(MAX(config_version), 0) AS max_version
                       FROM (SELECT config_version FROM agentensor_checkpoints
                              WHERE workflow_id = $1 FOR UPDATE) AS versions",
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
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.workflow_id)
        .bind(checkpoint.config_version)
        .bind(&checkpoint.runnable_config)
        .bind(&checkpoint.metrics)
        .bind(&checkpoint.metadata)
        .bind(&checkpoint.artifact_url)
        .bind(checkpoint.is_best)
        .bind(checkpoint.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        if checkpoint.is_best {
            sqlx::query(
                "UPDATE agentensor_checkpoints SET is_best = FALSE
                  WHERE workflow_id = $1 AND id != $2",
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
        let rows = match limit {
            Some(limit) => sqlx::query(
                "SELECT * FROM agentensor_checkpoints WHERE workflow_id = $1
                  ORDER BY config_version DESC LIMIT $2",
            )
            .bind(workflow_id)
            .bind(limit.max(0))
            .fetch_all(self.backend.pool())
            .await,
            None => sqlx::query(
                "SELECT * FROM agentensor_checkpoints WHERE workflow_id = $1
                  ORDER BY config_version DESC",
            )
            .bind(workflow_id)
            .fetch_all(self.backend.pool())
            .await,
        }
        .map_err(db_err)?;
        rows.iter().map(row_to_checkpoint).collect()
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<AgentensorCheckpoint, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM agentensor_checkpoints WHERE id = $1")
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
