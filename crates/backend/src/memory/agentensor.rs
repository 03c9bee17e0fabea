use crate::store::{AgentensorCheckpointStore, RecordCheckpointParams};
use async_trait::async_trait;
use orcheo_types::{AgentensorCheckpoint, OrcheoError};
use std::collections::HashMap;
use tokio::sync::Mutex;

#[derive(Default)]
struct CheckpointState {
    checkpoints: HashMap<String, AgentensorCheckpoint>,
    by_workflow: HashMap<String, Vec<String>>,
}

/// Async-safe in-memory checkpoint store.
#[derive(Default)]
pub struct InMemoryAgentensorCheckpointStore {
    state: Mutex<CheckpointState>,
}

impl InMemoryAgentensorCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AgentensorCheckpointStore for InMemoryAgentensorCheckpointStore {
    async fn record_checkpoint(
        &self,
        params: RecordCheckpointParams,
    ) -> Result<AgentensorCheckpoint, OrcheoError> {
        let mut state = self.state.lock().await;
        let next_version = params.config_version.unwrap_or_else(|| {
            state
                .by_workflow
                .get(&params.workflow_id)
                .into_iter()
                .flatten()
                .filter_map(|id| state.checkpoints.get(id))
                .map(|checkpoint| checkpoint.config_version)
                .max()
                .unwrap_or(0)
                + 1
        });
        let checkpoint = AgentensorCheckpoint::new(
            &params.workflow_id,
            next_version,
            params.runnable_config,
            params.metrics,
            params.metadata,
            params.artifact_url,
            params.is_best,
        );
        if params.is_best {
            let siblings: Vec<String> = state
                .by_workflow
                .get(&params.workflow_id)
                .cloned()
                .unwrap_or_default();
            for sibling in siblings {
                if let Some(existing) = state.checkpoints.get_mut(&sibling) {
                    existing.is_best = false;
                }
            }
        }
        state
            .by_workflow
            .entry(params.workflow_id.clone())
            .or_default()
            .push(checkpoint.id.clone());
        state
            .checkpoints
            .insert(checkpoint.id.clone(), checkpoint.clone());
        Ok(checkpoint)
    }

    async fn list_checkpoints(
        &self,
        workflow_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<AgentensorCheckpoint>, OrcheoError> {
        let state = self.state.lock().await;
        let mut checkpoints: Vec<AgentensorCheckpoint> = state
            .by_workflow
            .get(workflow_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.checkpoints.get(id))
            .cloned()
            .collect();
        checkpoints.sort_by(|a, b| b.config_version.cmp(&a.config_version));
        if let Some(limit) = limit {
            checkpoints.truncate(limit.max(0) as usize);
        }
        Ok(checkpoints)
    }

    async fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<AgentensorCheckpoint, OrcheoError> {
        let state = self.state.lock().await;
        state
            .checkpoints
            .get(checkpoint_id)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("checkpoint", checkpoint_id))
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
