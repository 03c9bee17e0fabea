//! Pluggable per-node checkpointing. Re-running with the same execution
//! id picks up the last snapshot and skips completed nodes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use orcheo_types::OrcheoError;
use serde_json::Value;

/// Snapshot of a run: nodes completed so far and the state after the
/// last one.
#[derive(Debug, Clone)]
pub struct RunCheckpoint {
    pub completed: Vec<String>,
    pub state: Value,
    pub updated_at: DateTime<Utc>,
}

/// Checkpoint sink keyed by `(execution_id, node_id)`.
#[async_trait]
pub trait NodeCheckpointer: Send + Sync {
    async fn save(
        &self,
        execution_id: &str,
        node_id: &str,
        state: &Value,
    ) -> Result<(), OrcheoError>;

    async fn load(&self, execution_id: &str) -> Result<Option<RunCheckpoint>, OrcheoError>;

    async fn clear(&self, execution_id: &str) -> Result<(), OrcheoError>;
}

/// Default in-memory checkpointer.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    checkpoints: DashMap<String, RunCheckpoint>,
}

impl InMemoryCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeCheckpointer for InMemoryCheckpointer {
    async fn save(
        &self,
        execution_id: &str,
        node_id: &str,
        state: &Value,
    ) -> Result<(), OrcheoError> {
        let mut entry = self
            .checkpoints
            .entry(execution_id.to_string())
            .or_insert_with(|| RunCheckpoint {
                completed: Vec::new(),
                state: Value::Null,
                updated_at: Utc::now(),
            });
        if !entry.completed.iter().any(|existing| existing == node_id) {
            entry.completed.push(node_id.to_string());
        }
        entry.state = state.clone();
        entry.updated_at = Utc::now();
        Ok(())
    }

    async fn load(&self, execution_id: &str) -> Result<Option<RunCheckpoint>, OrcheoError> {
        Ok(self
            .checkpoints
            .get(execution_id)
            .map(|checkpoint| checkpoint.clone()))
    }

    async fn clear(&self, execution_id: &str) -> Result<(), OrcheoError> {
        self.checkpoints.remove(execution_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn tracks_completed_nodes_and_latest_state() {
        let checkpointer = InMemoryCheckpointer::new();
        checkpointer
            .save("exec-1", "a", &json!({"x": 1}))
            .await
            .expect("save");
        checkpointer
            .save("exec-1", "b", &json!({"x": 2}))
            .await
            .expect("save");
        checkpointer
            .save("exec-1", "b", &json!({"x": 3}))
            .await
            .expect("save");
        let checkpoint = checkpointer
            .load("exec-1")
            .await
            .expect("load")
            .expect("some");
        assert_eq!(checkpoint.completed, vec!["a", "b"]);
        assert_eq!(checkpoint.state, json!({"x": 3}));
        checkpointer.clear("exec-1").await.expect("clear");
        assert!(checkpointer.load("exec-1").await.expect("load").is_none());
    }
}
