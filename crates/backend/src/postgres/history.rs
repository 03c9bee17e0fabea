use super::{db_err, PostgresBackend};
use crate::store::RunHistoryStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orcheo_types::{
    OrcheoError, RunHistoryRecord, RunHistoryStatus, RunHistoryStep, RunStartRequest,
    TraceMetadataUpdate,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::Row;

/// Run history persisted in `run_history_runs` + `run_history_steps`.
pub struct PostgresRunHistoryStore {
    backend: PostgresBackend,
}

impl PostgresRunHistoryStore {
    pub fn new(backend: PostgresBackend) -> Self {
        PostgresRunHistoryStore { backend }
    }

    async fn fetch_steps(
        &self,
        execution_id: &str,
        from_step: i64,
        limit: Option<i64>,
    ) -> Result<Vec<RunHistoryStep>, OrcheoError> {
        let rows = match limit {
            Some(limit) => {
                sqlx::query(
                    "SELECT ordinal, at, payload FROM run_history_steps
                      WHERE execution_id = $1 AND ordinal >= $2
                      ORDER BY ordinal LIMIT $3",
                )
                .bind(execution_id)
                .bind(from_step.max(0))
                .bind(limit.max(0))
                .fetch_all(self.backend.pool())
                .await
            }
            None => {
                sqlx::query(
                    "SELECT ordinal, at, payload FROM run_history_steps
                      WHERE execution_id = $1 AND ordinal >= $2 ORDER BY ordinal",
                )
                .bind(execution_id)
                .bind(from_step.max(0))
                .fetch_all(self.backend.pool())
                .await
            }
        }
        .map_err(db_err)?;
        rows.iter().map(row_to_step).collect()
    }
}

fn row_to_record(row: &PgRow) -> Result<RunHistoryRecord, OrcheoError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    Ok(RunHistoryRecord {
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        status: RunHistoryStatus::parse(&status)?,
        started_at: row.try_get("started_at").map_err(db_err)?,
        completed_at: row.try_get("completed_at").map_err(db_err)?,
        error: row.try_get("error").map_err(db_err)?,
        inputs: row.try_get("inputs").map_err(db_err)?,
        runnable_config: row.try_get("runnable_config").map_err(db_err)?,
        steps: Vec::new(),
        trace_id: row.try_get("trace_id").map_err(db_err)?,
        trace_started_at: row.try_get("trace_started_at").map_err(db_err)?,
        trace_completed_at: row.try_get("trace_completed_at").map_err(db_err)?,
        trace_last_span_at: row.try_get("trace_last_span_at").map_err(db_err)?,
    })
}

fn row_to_step(row: &PgRow) -> Result<RunHistoryStep, OrcheoError> {
    Ok(RunHistoryStep {
        index: row.try_get("ordinal").map_err(db_err)?,
        at: row.try_get("at").map_err(db_err)?,
        payload: row.try_get("payload").map_err(db_err)?,
    })
}

async fn apply_terminal(
    store: &PostgresRunHistoryStore,
    execution_id: &str,
    target: RunHistoryStatus,
    error: Option<&str>,
) -> Result<(), OrcheoError> {
    let mut tx = store.backend.pool().begin().await.map_err(db_err)?;
    let row = sqlx::query(
        "SELECT status FROM run_history_runs WHERE execution_id = $1 FOR UPDATE",
    )
    .bind(execution_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(db_err)?
    .ok_or_else(|| OrcheoError::not_found("execution", execution_id))?;
    let current = RunHistoryStatus::parse(&row.try_get::<String, _>("status").map_err(db_err)?)?;
    if current == target {
        return Ok(());
    }
    if current.is_terminal() {
        return Err(OrcheoError::InvalidTransition(format!(
            "execution {execution_id} is already {} and cannot become {}",
            current.as_str(),
            target.as_str()
        )));
    }
    let now: DateTime<Utc> = Utc::now();
    sqlx::query(
        "UPDATE run_history_runs
            SET status = $1, completed_at = $2, trace_completed_at = $2, error = $3
          WHERE execution_id = $4",
    )
    .bind(target.as_str())
    .bind(now)
    .bind(error)
    .bind(execution_id)
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;
    tx.commit().await.map_err(db_err)
}

#[async_trait]
impl RunHistoryStore for PostgresRunHistoryStore {
    async fn start_run(&self, request: RunStartRequest) -> Result<RunHistoryRecord, OrcheoError> {
        self.backend.ensure_schema().await?;
        let started_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO run_history_runs (
                execution_id, workflow_id, status, started_at, inputs,
                runnable_config, trace_id, trace_started_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (execution_id) DO NOTHING",
        )
        .bind(&request.execution_id)
        .bind(&request.workflow_id)
        .bind(RunHistoryStatus::Running.as_str())
        .bind(started_at)
        .bind(&request.inputs)
        .bind(&request.runnable_config)
        .bind(&request.trace_id)
        .bind(request.trace_started_at)
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(OrcheoError::RunHistory(format!(
                "execution {} already exists",
                request.execution_id
            )));
        }
        Ok(RunHistoryRecord {
            execution_id: request.execution_id,
            workflow_id: request.workflow_id,
            status: RunHistoryStatus::Running,
            started_at,
            completed_at: None,
            error: None,
            inputs: request.inputs,
            runnable_config: request.runnable_config,
            steps: Vec::new(),
            trace_id: request.trace_id,
            trace_started_at: request.trace_started_at,
            trace_completed_at: None,
            trace_last_span_at: None,
        })
    }

    async fn append_step(
        &self,
        execution_id: &str,
        payload: Value,
    ) -> Result<RunHistoryStep, OrcheoError> {
        self.backend.ensure_schema().await?;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        // Lock the run row so concurrent appenders allocate distinct
        // ordinals.
        let run = sqlx::query(
            "SELECT execution_id FROM run_history_runs WHERE execution_id = $1 FOR UPDATE",
        )
        .bind(execution_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if run.is_none() {
            return Err(OrcheoError::not_found("execution", execution_id));
        }
        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) AS next
               FROM run_history_steps WHERE execution_id = $1",
        )
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .try_get("next")
        .map_err(db_err)?;
        let at = Utc::now();
        sqlx::query(
            "INSERT INTO run_history_steps (execution_id, ordinal, at, payload)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(execution_id)
        .bind(next)
        .bind(at)
        .bind(&payload)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("UPDATE run_history_runs SET trace_last_span_at = $1 WHERE execution_id = $2")
            .bind(at)
            .bind(execution_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(RunHistoryStep {
            index: next,
            at,
            payload,
        })
    }

    async fn mark_completed(&self, execution_id: &str) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        apply_terminal(self, execution_id, RunHistoryStatus::Completed, None).await
    }

    async fn mark_failed(
        &self,
        execution_id: &str,
        error_message: &str,
    ) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        apply_terminal(
            self,
            execution_id,
            RunHistoryStatus::Failed,
            Some(error_message),
        )
        .await
    }

    async fn mark_cancelled(
        &self,
        execution_id: &str,
        reason: Option<&str>,
    ) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        apply_terminal(self, execution_id, RunHistoryStatus::Cancelled, reason).await
    }

    async fn update_trace_metadata(
        &self,
        execution_id: &str,
        update: TraceMetadataUpdate,
    ) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        let result = sqlx::query(
            "UPDATE run_history_runs
                SET trace_id = COALESCE($1, trace_id),
                    trace_started_at = COALESCE($2, trace_started_at),
                    trace_last_span_at = COALESCE($3, trace_last_span_at)
              WHERE execution_id = $4",
        )
        .bind(&update.trace_id)
        .bind(update.started_at)
        .bind(update.updated_at)
        .bind(execution_id)
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(OrcheoError::not_found("execution", execution_id));
        }
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<RunHistoryRecord, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM run_history_runs WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("execution", execution_id))?;
        let mut record = row_to_record(&row)?;
        record.steps = self.fetch_steps(execution_id, 0, None).await?;
        Ok(record)
    }

    async fn list_steps(
        &self,
        execution_id: &str,
        from_step: i64,
        limit: Option<i64>,
    ) -> Result<Vec<RunHistoryStep>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let exists = sqlx::query("SELECT 1 FROM run_history_runs WHERE execution_id = $1")
            .bind(execution_id)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(OrcheoError::not_found("execution", execution_id));
        }
        self.fetch_steps(execution_id, from_step, limit).await
    }

    async fn list_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<RunHistoryRecord>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT * FROM run_history_runs WHERE workflow_id = $1 ORDER BY started_at DESC",
        )
        .bind(workflow_id)
        .fetch_all(self.backend.pool())
        .await
        .map_err(db_err)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut record = row_to_record(row)?;
            record.steps = self.fetch_steps(&record.execution_id, 0, None).await?;
            records.push(record);
        }
        Ok(records)
    }
}
