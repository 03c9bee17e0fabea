//! Async storage contracts shared by the in-memory, SQLite, and Postgres
//! backends. A factory in the crate root picks the backend at startup.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orcheo_types::{
    canonical_json_pretty, diff_lines, AgentensorCheckpoint, ChatAttachment,
    CredentialAccessContext, CredentialMetadata, CredentialTemplate, OrcheoError, Page,
    RunHistoryRecord, RunHistoryStep, RunStartRequest, SortOrder, ThreadItem, ThreadMetadata,
    TraceMetadataUpdate, Workflow, WorkflowRun, WorkflowVersion,
};
use serde_json::Value;
use uuid::Uuid;

/// Durable log of runs and their ordered steps.
#[async_trait]
pub trait RunHistoryStore: Send + Sync {
    /// Open a new record; fails when the execution id is already taken.
    async fn start_run(&self, request: RunStartRequest) -> Result<RunHistoryRecord, OrcheoError>;

    /// Append a step with the next sequential index and bump
    /// `trace_last_span_at`.
    async fn append_step(
        &self,
        execution_id: &str,
        payload: Value,
    ) -> Result<RunHistoryStep, OrcheoError>;

    /// Transition the record to `completed`. Idempotent for the same
    /// target state; conflicting terminal states fail.
    async fn mark_completed(&self, execution_id: &str) -> Result<(), OrcheoError>;

    async fn mark_failed(&self, execution_id: &str, error_message: &str)
        -> Result<(), OrcheoError>;

    async fn mark_cancelled(
        &self,
        execution_id: &str,
        reason: Option<&str>,
    ) -> Result<(), OrcheoError>;

    async fn update_trace_metadata(
        &self,
        execution_id: &str,
        update: TraceMetadataUpdate,
    ) -> Result<(), OrcheoError>;

    async fn get(&self, execution_id: &str) -> Result<RunHistoryRecord, OrcheoError>;

    async fn list_steps(
        &self,
        execution_id: &str,
        from_step: i64,
        limit: Option<i64>,
    ) -> Result<Vec<RunHistoryStep>, OrcheoError>;

    async fn list_for_workflow(
        &self,
        workflow_id: &str,
    ) -> Result<Vec<RunHistoryRecord>, OrcheoError>;
}

/// Diff between two workflow versions, expressed as unified-diff lines
/// over the pretty canonical-JSON encoding of each graph.
#[derive(Debug, Clone)]
pub struct VersionDiff {
    pub base: WorkflowVersion,
    pub target: WorkflowVersion,
    pub lines: Vec<String>,
}

/// Owner of workflows, immutable versions, and runs. Workflows are never
/// deleted; archive instead.
#[async_trait]
pub trait WorkflowRepository: Send + Sync {
    async fn create_workflow(&self, workflow: Workflow) -> Result<Workflow, OrcheoError>;
    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, OrcheoError>;
    async fn get_workflow_by_slug(&self, slug: &str) -> Result<Workflow, OrcheoError>;
    async fn list_workflows(&self, include_archived: bool) -> Result<Vec<Workflow>, OrcheoError>;
    /// Persist a workflow mutated through its lifecycle methods.
    async fn update_workflow(&self, workflow: Workflow) -> Result<Workflow, OrcheoError>;

    /// Create the next immutable version; numbering is monotonic from 1
    /// per workflow.
    async fn create_version(
        &self,
        workflow_id: Uuid,
        graph: Value,
        metadata: Value,
        created_by: &str,
        notes: Option<String>,
    ) -> Result<WorkflowVersion, OrcheoError>;
    async fn get_version(&self, id: Uuid) -> Result<WorkflowVersion, OrcheoError>;
    async fn get_version_by_number(
        &self,
        workflow_id: Uuid,
        version: i64,
    ) -> Result<WorkflowVersion, OrcheoError>;
    async fn latest_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, OrcheoError>;
    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersion>, OrcheoError>;

    async fn create_run(&self, run: WorkflowRun) -> Result<WorkflowRun, OrcheoError>;
    async fn get_run(&self, id: Uuid) -> Result<WorkflowRun, OrcheoError>;
    async fn list_runs(&self, workflow_id: Uuid) -> Result<Vec<WorkflowRun>, OrcheoError>;
    async fn update_run(&self, run: WorkflowRun) -> Result<WorkflowRun, OrcheoError>;

    // Lifecycle helpers: load, apply the entity transition, persist. The
    // transition methods own the state-machine rules.

    async fn publish_workflow(
        &self,
        workflow_id: Uuid,
        token_hash: &str,
        require_login: bool,
        actor: &str,
    ) -> Result<Workflow, OrcheoError> {
        let mut workflow = self.get_workflow(workflow_id).await?;
        workflow.publish(token_hash, require_login, actor)?;
        self.update_workflow(workflow).await
    }

    async fn rotate_publish_token(
        &self,
        workflow_id: Uuid,
        token_hash: &str,
        actor: &str,
    ) -> Result<Workflow, OrcheoError> {
        let mut workflow = self.get_workflow(workflow_id).await?;
        workflow.rotate_publish_token(token_hash, actor)?;
        self.update_workflow(workflow).await
    }

    async fn revoke_publish(&self, workflow_id: Uuid, actor: &str) -> Result<Workflow, OrcheoError> {
        let mut workflow = self.get_workflow(workflow_id).await?;
        workflow.revoke_publish(actor)?;
        self.update_workflow(workflow).await
    }

    async fn mark_run_started(&self, run_id: Uuid, actor: &str) -> Result<WorkflowRun, OrcheoError> {
        let mut run = self.get_run(run_id).await?;
        run.mark_started(actor)?;
        self.update_run(run).await
    }

    async fn mark_run_succeeded(
        &self,
        run_id: Uuid,
        actor: &str,
        output: Option<Value>,
    ) -> Result<WorkflowRun, OrcheoError> {
        let mut run = self.get_run(run_id).await?;
        run.mark_succeeded(actor, output)?;
        self.update_run(run).await
    }

    async fn mark_run_failed(
        &self,
        run_id: Uuid,
        actor: &str,
        error: &str,
    ) -> Result<WorkflowRun, OrcheoError> {
        let mut run = self.get_run(run_id).await?;
        run.mark_failed(actor, error)?;
        self.update_run(run).await
    }

    async fn mark_run_cancelled(
        &self,
        run_id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<WorkflowRun, OrcheoError> {
        let mut run = self.get_run(run_id).await?;
        run.mark_cancelled(actor, reason)?;
        self.update_run(run).await
    }

    async fn diff_versions(
        &self,
        workflow_id: Uuid,
        base: i64,
        target: i64,
    ) -> Result<VersionDiff, OrcheoError> {
        let base_version = self.get_version_by_number(workflow_id, base).await?;
        let target_version = self.get_version_by_number(workflow_id, target).await?;
        let lines = diff_lines(
            &canonical_json_pretty(&base_version.graph),
            &canonical_json_pretty(&target_version.graph),
        );
        Ok(VersionDiff {
            base: base_version,
            target: target_version,
            lines,
        })
    }
}

/// Thread, item, and attachment storage for conversational executions.
#[async_trait]
pub trait ChatStore: Send + Sync {
    /// Upsert a thread by id.
    async fn save_thread(&self, thread: ThreadMetadata) -> Result<(), OrcheoError>;
    async fn load_thread(&self, thread_id: &str) -> Result<ThreadMetadata, OrcheoError>;
    /// Keyset pagination by `(created_at, id)`.
    async fn load_threads(
        &self,
        limit: i64,
        after: Option<&str>,
        order: SortOrder,
    ) -> Result<Page<ThreadMetadata>, OrcheoError>;
    /// Cascades to items, attachments, and attachment blobs on disk.
    async fn delete_thread(&self, thread_id: &str) -> Result<(), OrcheoError>;

    /// Append an item, assigning the next per-thread ordinal.
    async fn add_thread_item(
        &self,
        thread_id: &str,
        item: ThreadItem,
    ) -> Result<ThreadItem, OrcheoError>;
    /// Upsert an item by `(thread_id, item_id)` keeping its ordinal.
    async fn save_item(&self, item: ThreadItem) -> Result<(), OrcheoError>;
    async fn load_item(&self, thread_id: &str, item_id: &str) -> Result<ThreadItem, OrcheoError>;
    /// Ordinal-based pagination. The `after` marker resolves only inside
    /// the given thread; unknown markers start the page from ordinal 0.
    async fn load_thread_items(
        &self,
        thread_id: &str,
        after: Option<&str>,
        limit: i64,
        order: SortOrder,
    ) -> Result<Page<ThreadItem>, OrcheoError>;
    /// Substring search over serialized item payloads in one thread.
    async fn search_thread_items(
        &self,
        thread_id: &str,
        query: &str,
        after: Option<&str>,
        limit: i64,
    ) -> Result<Page<ThreadItem>, OrcheoError>;
    /// Delete threads with `updated_at < cutoff`; returns the count.
    async fn prune_threads_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, OrcheoError>;

    async fn save_attachment(&self, attachment: ChatAttachment) -> Result<(), OrcheoError>;
    async fn load_attachment(&self, attachment_id: &str) -> Result<ChatAttachment, OrcheoError>;
    async fn delete_attachment(&self, attachment_id: &str) -> Result<(), OrcheoError>;
}

/// Parameters for recording an agentensor checkpoint.
#[derive(Debug, Clone)]
pub struct RecordCheckpointParams {
    pub workflow_id: String,
    pub runnable_config: Value,
    pub metrics: Value,
    pub metadata: Value,
    pub artifact_url: Option<String>,
    pub is_best: bool,
    pub config_version: Option<i64>,
}

/// Agentensor training checkpoint persistence with best-of-workflow
/// promotion.
#[async_trait]
pub trait AgentensorCheckpointStore: Send + Sync {
    /// Insert a checkpoint, resolving the next config version under a
    /// lock; when `is_best` is set, every other row for the workflow is
    /// demoted in the same transaction.
    async fn record_checkpoint(
        &self,
        params: RecordCheckpointParams,
    ) -> Result<AgentensorCheckpoint, OrcheoError>;
    /// Newest-first by config version.
    async fn list_checkpoints(
        &self,
        workflow_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<AgentensorCheckpoint>, OrcheoError>;
    async fn get_checkpoint(&self, checkpoint_id: &str)
        -> Result<AgentensorCheckpoint, OrcheoError>;
    async fn latest_checkpoint(
        &self,
        workflow_id: &str,
    ) -> Result<Option<AgentensorCheckpoint>, OrcheoError>;
}

/// Persistence for vault credentials and issuance templates. Scope and
/// encryption rules live in the vault; this is storage only.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Insert a credential; duplicate names within the same workflow
    /// scope fail with `NameConflict`.
    async fn insert(&self, credential: CredentialMetadata)
        -> Result<CredentialMetadata, OrcheoError>;
    async fn get(&self, id: Uuid) -> Result<CredentialMetadata, OrcheoError>;
    async fn update(&self, credential: CredentialMetadata)
        -> Result<CredentialMetadata, OrcheoError>;
    async fn delete(&self, id: Uuid) -> Result<(), OrcheoError>;
    async fn list_all(&self) -> Result<Vec<CredentialMetadata>, OrcheoError>;
    /// Credentials visible in the given context: public ∪ shared/global ∪
    /// those scoped to the context's workflow.
    async fn list_visible(
        &self,
        context: &CredentialAccessContext,
    ) -> Result<Vec<CredentialMetadata>, OrcheoError>;

    async fn upsert_template(&self, template: CredentialTemplate) -> Result<(), OrcheoError>;
    async fn get_template(&self, provider: &str) -> Result<CredentialTemplate, OrcheoError>;
    async fn list_templates(&self) -> Result<Vec<CredentialTemplate>, OrcheoError>;
}
