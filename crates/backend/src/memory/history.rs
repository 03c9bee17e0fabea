use crate::store::RunHistoryStore;
use async_trait::async_trait;
use chrono::Utc;
use orcheo_types::{
    OrcheoError, RunHistoryRecord, RunHistoryStatus, RunHistoryStep, RunStartRequest,
    TraceMetadataUpdate,
};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Run history backed by a process-local map.
#[derive(Default)]
pub struct InMemoryRunHistoryStore {
    records: Mutex<HashMap<String, RunHistoryRecord>>,
}

impl InMemoryRunHistoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_terminal(
    record: &mut RunHistoryRecord,
    target: RunHistoryStatus,
    error: Option<String>,
) -> Result<(), OrcheoError> {
    if record.status == target {
        return Ok(());
    }
    if record.status.is_terminal() {
        return Err(OrcheoError::InvalidTransition(format!(
            "execution {} is already {} and cannot become {}",
            record.execution_id,
            record.status.as_str(),
            target.as_str()
        )));
    }
    let now = Utc::now();
    record.status = target;
    record.completed_at = Some(now);
    record.trace_completed_at = Some(now);
    record.error = error;
    Ok(())
}

#[async_trait]
impl RunHistoryStore for InMemoryRunHistoryStore {
    async fn start_run(&self, request: RunStartRequest) -> Result<RunHistoryRecord, OrcheoError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&request.execution_id) {
            return Err(OrcheoError::RunHistory(format!(
                "execution {} already exists",
                request.execution_id
            )));
        }
        let record = RunHistoryRecord {
            execution_id: request.execution_id.clone(),
            workflow_id: request.workflow_id,
            status: RunHistoryStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
            inputs: request.inputs,
            runnable_config: request.runnable_config,
            steps: Vec::new(),
            trace_id: request.trace_id,
            trace_started_at: request.trace_started_at,
            trace_completed_at: None,
            trace_last_span_at: None,
        };
        records.insert(request.execution_id, record.clone());
        Ok(record)
    }

    async fn append_step(
        &self,
        execution_id: &str,
        payload: Value,
    ) -> Result<RunHistoryStep, OrcheoError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(execution_id)
            .ok_or_else(|| OrcheoError::not_found("execution", execution_id))?;
        let step = RunHistoryStep {
            index: record.steps.len() as i64,
            at: Utc::now(),
            payload,
        };
        record.trace_last_span_at = Some(step.at);
        record.steps.push(step.clone());
        Ok(step)
    }

    async fn mark_completed(&self, execution_id: &str) -> Result<(), OrcheoError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(execution_id)
            .ok_or_else(|| OrcheoError::not_found("execution", execution_id))?;
        apply_terminal(record, RunHistoryStatus::Completed, None)
    }

    async fn mark_failed(
        &self,
        execution_id: &str,
        error_message: &str,
    ) -> Result<(), OrcheoError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(execution_id)
            .ok_or_else(|| OrcheoError::not_found("execution", execution_id))?;
        apply_terminal(
            record,
            RunHistoryStatus::Failed,
            Some(error_message.to_string()),
        )
    }

    async fn mark_cancelled(
        &self,
        execution_id: &str,
        reason: Option<&str>,
    ) -> Result<(), OrcheoError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(execution_id)
            .ok_or_else(|| OrcheoError::not_found("execution", execution_id))?;
        apply_terminal(
            record,
            RunHistoryStatus::Cancelled,
            reason.map(str::to_string),
        )
    }

    async fn update_trace_metadata(
        &self,
        execution_id: &str,
        update: TraceMetadataUpdate,
    ) -> Result<(), OrcheoError> {
        let mut records = self.records.lock().await;
        let record = records
            .get_mut(execution_id)
            .ok_or_else(|| OrcheoError::not_found("execution", execution_id))?;
        if let Some(trace_id) = update.trace_id {
            record.trace_id = Some(trace_id);
        }
        if let Some(started_at) = update.started_at {
            record.trace_started_at = Some(started_at);
        }
        if let Some(updated_at) = update.updated_at {
            record.trace_last_span_at = Some(updated_at);
        }
        Ok(())
    }

    async fn get(&self, execution_id: &str) -> Result<RunHistoryRecord, OrcheoError> {
        let records = self.records.lock().await;
        records
            .get(execution_id)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("execution", execution_id))
    }

    async fn list_steps(
        &self,
        execution_id: &str,
        from_step: i64,
        limit: Option<i64>,
    ) -> Result<Vec<RunHistoryStep>, OrcheoError> {
        let records = self.records.lock().await;
        let record = records
            .get(execution_id)
            .ok_or_else(|| OrcheoError::not_found("execution", execution_id))?;
        let start = from_step.max(0) as usize;
        let mut steps: Vec<RunHistoryStep> = record.steps.iter().skip(start).cloned().collect();
        if let Some(limit) = limit {
            steps.truncate(limit.max(0) as usize);
        }
        Ok(steps)
    }

    async fn list_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<RunHistoryRecord>, OrcheoError> {
        let records = self.records.lock().await;
        let mut matching: Vec<RunHistoryRecord> = records
            .values()
            .filter(|record| record.workflow_id == workflow_id)
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(matching)
    }
}
