use super::{db_err, decode_json, decode_opt_ts, decode_ts, encode_json, encode_opt_ts, encode_ts, SqliteBackend};
use crate::store::RunHistoryStore;
use async_trait::async_trait;
use chrono::Utc;
use orcheo_types::{
    OrcheoError, RunHistoryRecord, RunHistoryStatus, RunHistoryStep, RunStartRequest,
    TraceMetadataUpdate,
};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

/// Run history persisted in `run_history_runs` + `run_history_steps`.
pub struct SqliteRunHistoryStore {
    backend: SqliteBackend,
}

impl SqliteRunHistoryStore {
    pub fn new(backend: SqliteBackend) -> Self {
        SqliteRunHistoryStore { backend }
    }

    async fn fetch_record(&self, execution_id: &str) -> Result<RunHistoryRecord, OrcheoError> {
        let row = sqlx::query(
            "SELECT execution_id, workflow_id, status, started_at, completed_at, error,
                    inputs_json, runnable_config_json, trace_id, trace_started_at,
                    trace_completed_at, trace_last_span_at
               FROM run_history_runs WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_optional(self.backend.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| OrcheoError::not_found("execution", execution_id))?;
        row_to_record(&row)
    }

    async fn fetch_steps(
        &self,
        execution_id: &str,
        from_step: i64,
        limit: Option<i64>,
    ) -> Result<Vec<RunHistoryStep>, OrcheoError> {
        let mut query = String::from(
            "SELECT ordinal, at, payload_json FROM run_history_steps
              WHERE execution_id = ? AND ordinal >= ? ORDER BY ordinal",
        );
        if limit.is_some() {
            query.push_str(" LIMIT ?");
        }
        let mut prepared = sqlx::query(&query).bind(execution_id).bind(from_step.max(0));
        if let Some(limit) = limit {
            prepared = prepared.bind(limit.max(0));
        }
        let rows = prepared
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_step).collect()
    }
}

fn row_to_record(row: &SqliteRow) -> Result<RunHistoryRecord, OrcheoError> {
    let status: String = row.try_get("status").map_err(db_err)?;
    let started_at: String = row.try_get("started_at").map_err(db_err)?;
    let inputs_json: String = row.try_get("inputs_json").map_err(db_err)?;
    let runnable_config_json: Option<String> =
        row.try_get("runnable_config_json").map_err(db_err)?;
    Ok(RunHistoryRecord {
        execution_id: row.try_get("execution_id").map_err(db_err)?,
        workflow_id: row.try_get("workflow_id").map_err(db_err)?,
        status: RunHistoryStatus::parse(&status)?,
        started_at: decode_ts(&started_at)?,
        completed_at: decode_opt_ts(row.try_get("completed_at").map_err(db_err)?)?,
        error: row.try_get("error").map_err(db_err)?,
        inputs: decode_json(&inputs_json)?,
        runnable_config: runnable_config_json
            .as_deref()
            .map(decode_json)
            .transpose()?,
        steps: Vec::new(),
        trace_id: row.try_get("trace_id").map_err(db_err)?,
        trace_started_at: decode_opt_ts(row.try_get("trace_started_at").map_err(db_err)?)?,
        trace_completed_at: decode_opt_ts(row.try_get("trace_completed_at").map_err(db_err)?)?,
        trace_last_span_at: decode_opt_ts(row.try_get("trace_last_span_at").map_err(db_err)?)?,
    })
}

fn row_to_step(row: &SqliteRow) -> Result<RunHistoryStep, OrcheoError> {
    let at: String = row.try_get("at").map_err(db_err)?;
    let payload_json: String = row.try_get("payload_json").map_err(db_err)?;
    Ok(RunHistoryStep {
        index: row.try_get("ordinal").map_err(db_err)?,
        at: decode_ts(&at)?,
        payload: decode_json(&payload_json)?,
    })
}

async fn apply_terminal(
    store: &SqliteRunHistoryStore,
    execution_id: &str,
    target: RunHistoryStatus,
    error: Option<&str>,
) -> Result<(), OrcheoError> {
    let _writer = store.backend.writer().lock().await;
    let mut tx = store.backend.pool().begin().await.map_err(db_err)?;
    let row = sqlx::query("SELECT status FROM run_history_runs WHERE execution_id = ?")
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
    let now = encode_ts(&Utc::now());
    sqlx::query(
        "UPDATE run_history_runs
            SET status = ?, completed_at = ?, trace_completed_at = ?, error = ?
          WHERE execution_id = ?",
    )
    .bind(target.as_str())
    .bind(&now)
    .bind(&now)
    .bind(error)
    .bind(execution_id)
    .execute(&mut *tx)
    .await
    .map_err(db_err)?;
    tx.commit().await.map_err(db_err)
}

#[async_trait]
impl RunHistoryStore for SqliteRunHistoryStore {
    async fn start_run(&self, request: RunStartRequest) -> Result<RunHistoryRecord, OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let exists = sqlx::query("SELECT 1 FROM run_history_runs WHERE execution_id = ?")
            .bind(&request.execution_id)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?;
        if exists.is_some() {
            return Err(OrcheoError::RunHistory(format!(
                "execution {} already exists",
                request.execution_id
            )));
        }
        let started_at = Utc::now();
        sqlx::query(
            "INSERT INTO run_history_runs (
                execution_id, workflow_id, status, started_at, inputs_json,
                runnable_config_json, trace_id, trace_started_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&request.execution_id)
        .bind(&request.workflow_id)
        .bind(RunHistoryStatus::Running.as_str())
        .bind(encode_ts(&started_at))
        .bind(encode_json(&request.inputs)?)
        .bind(
            request
                .runnable_config
                .as_ref()
                .map(encode_json)
                .transpose()?,
        )
        .bind(&request.trace_id)
        .bind(encode_opt_ts(&request.trace_started_at))
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
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
        let _writer = self.backend.writer().lock().await;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let exists = sqlx::query("SELECT 1 FROM run_history_runs WHERE execution_id = ?")
            .bind(execution_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(OrcheoError::not_found("execution", execution_id));
        }
        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(ordinal) + 1, 0) AS next
               FROM run_history_steps WHERE execution_id = ?",
        )
        .bind(execution_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .try_get("next")
        .map_err(db_err)?;
        let at = Utc::now();
        sqlx::query(
            "INSERT INTO run_history_steps (execution_id, ordinal, at, payload_json)
             VALUES (?, ?, ?, ?)",
        )
        .bind(execution_id)
        .bind(next)
        .bind(encode_ts(&at))
        .bind(encode_json(&payload)?)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        sqlx::query("UPDATE run_history_runs SET trace_last_span_at = ? WHERE execution_id = ?")
            .bind(encode_ts(&at))
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
        let _writer = self.backend.writer().lock().await;
        let result = sqlx::query(
            "UPDATE run_history_runs
                SET trace_id = COALESCE(?, trace_id),
                    trace_started_at = COALESCE(?, trace_started_at),
                    trace_last_span_at = COALESCE(?, trace_last_span_at)
              WHERE execution_id = ?",
        )
        .bind(&update.trace_id)
        .bind(encode_opt_ts(&update.started_at))
        .bind(encode_opt_ts(&update.updated_at))
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
        let mut record = self.fetch_record(execution_id).await?;
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
        // Ensure the record exists so unknown executions surface NotFound
        // rather than an empty page.
        self.fetch_record(execution_id).await?;
        self.fetch_steps(execution_id, from_step, limit).await
    }

    async fn list_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<RunHistoryRecord>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT execution_id, workflow_id, status, started_at, completed_at, error,
                    inputs_json, runnable_config_json, trace_id, trace_started_at,
                    trace_completed_at, trace_last_span_at
               FROM run_history_runs WHERE workflow_id = ? ORDER BY started_at DESC",
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
