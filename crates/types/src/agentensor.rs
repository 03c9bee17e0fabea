//! Agentensor training checkpoints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Versioned training snapshot. At most one checkpoint per workflow may
/// carry `is_best` at any time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentensorCheckpoint {
    pub id: String,
    pub workflow_id: String,
    pub config_version: i64,
    pub runnable_config: Value,
    pub metrics: Value,
    pub metadata: Value,
    pub artifact_url: Option<String>,
    pub is_best: bool,
    pub created_at: DateTime<Utc>,
}

impl AgentensorCheckpoint {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        workflow_id: &str,
        config_version: i64,
        runnable_config: Value,
        metrics: Value,
        metadata: Value,
        artifact_url: Option<String>,
        is_best: bool,
    ) -> Self {
        AgentensorCheckpoint {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            config_version,
            runnable_config,
            metrics,
            metadata,
            artifact_url,
            is_best,
            created_at: Utc::now(),
        }
    }
}
