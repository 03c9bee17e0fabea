//! Orchestrator façade: wires the backend, vault, OAuth health gate,
//! compiler, engine, webhook admission, and chat service behind the
//! surface used by transport and CLI collaborators.

use crate::chat::ChatService;
use crate::engine::{
    CancelToken, EngineSettings, ExecutionEngine, InMemoryCheckpointer, ProgressSink, RunOutcome,
    RunRequest,
};
use crate::graph::{ingest_script, GraphCompiler, NodeRegistry};
use crate::trace::{trace_response, TraceResponse};
use crate::vault::oauth::OAuthCredentialService;
use crate::vault::{CredentialResolver, CredentialVault, SecretCipher};
use crate::webhook::{WebhookAdmission, WebhookRequest};
use dashmap::DashMap;
use orcheo_backend::{
    AgentensorCheckpointStore, Backend, BackendConfig, ChatStore, RecordCheckpointParams,
    RunHistoryStore, WorkflowRepository,
};
use orcheo_types::{
    AgentensorCheckpoint, OrcheoError, WebhookTriggerConfig, Workflow, WorkflowRun,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Runtime configuration (§ environment): backend selector, vault key,
/// OAuth refresh margin, chat retention, engine limits.
#[derive(Debug, Clone)]
pub struct OrcheoConfig {
    pub backend: BackendConfig,
    pub encryption_key: String,
    pub oauth_ttl_margin_seconds: i64,
    pub chat_retention: Duration,
    pub chat_prune_interval: Duration,
    pub engine: EngineSettings,
}

impl OrcheoConfig {
    pub fn new(backend: BackendConfig, encryption_key: &str) -> Self {
        OrcheoConfig {
            backend,
            encryption_key: encryption_key.to_string(),
            oauth_ttl_margin_seconds: 300,
            chat_retention: Duration::from_secs(30 * 24 * 60 * 60),
            chat_prune_interval: Duration::from_secs(60 * 60),
            engine: EngineSettings::default(),
        }
    }
}

/// The composed runtime.
pub struct Orcheo {
    repository: Arc<dyn WorkflowRepository>,
    history: Arc<dyn RunHistoryStore>,
    checkpoints: Arc<dyn AgentensorCheckpointStore>,
    chat: Arc<ChatService>,
    vault: Arc<CredentialVault>,
    oauth: Arc<OAuthCredentialService>,
    webhooks: WebhookAdmission,
    engine: Arc<ExecutionEngine>,
    active_runs: DashMap<String, CancelToken>,
    retention_task: JoinHandle<()>,
}

impl Orcheo {
    /// Connect the configured backend and wire every subsystem.
    pub async fn connect(
        config: OrcheoConfig,
        registry: NodeRegistry,
    ) -> Result<Self, OrcheoError> {
        let backend = Backend::connect(&config.backend).await?;
        let cipher = Arc::new(SecretCipher::new(&config.encryption_key)?);
        let vault = Arc::new(CredentialVault::new(backend.credentials.clone(), cipher));
        let oauth = Arc::new(OAuthCredentialService::new(
            vault.clone(),
            config.oauth_ttl_margin_seconds,
        )?);
        let chat = Arc::new(ChatService::new(backend.chat.clone()));
        let retention_task =
            chat.spawn_retention_loop(config.chat_retention, config.chat_prune_interval);
        let engine = Arc::new(ExecutionEngine::new(
            GraphCompiler::new(registry),
            backend.history.clone(),
            backend.repository.clone(),
            Arc::new(InMemoryCheckpointer::new()),
            config.engine.clone(),
        ));
        Ok(Orcheo {
            repository: backend.repository,
            history: backend.history,
            checkpoints: backend.checkpoints,
            chat,
            vault,
            oauth,
            webhooks: WebhookAdmission::new(),
            engine,
            active_runs: DashMap::new(),
            retention_task,
        })
    }

    pub fn repository(&self) -> &Arc<dyn WorkflowRepository> {
        &self.repository
    }

    pub fn history(&self) -> &Arc<dyn RunHistoryStore> {
        &self.history
    }

    pub fn chat(&self) -> &Arc<ChatService> {
        &self.chat
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    pub fn oauth(&self) -> &Arc<OAuthCredentialService> {
        &self.oauth
    }

    pub fn webhooks(&self) -> &WebhookAdmission {
        &self.webhooks
    }

    /// Create a pending run against the workflow's latest version.
    pub async fn create_run(
        &self,
        workflow_id: Uuid,
        inputs: Value,
        triggered_by: &str,
    ) -> Result<WorkflowRun, OrcheoError> {
        let version = self
            .repository
            .latest_version(workflow_id)
            .await?
            .ok_or_else(|| {
                OrcheoError::Validation(format!("workflow {workflow_id} has no versions"))
            })?;
        let run = WorkflowRun::new(workflow_id, version.id, triggered_by, inputs);
        self.repository.create_run(run).await
    }

    /// Drive a pending run to completion: health gate, then the engine.
    pub async fn execute_run(
        &self,
        run_id: Uuid,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<RunOutcome, OrcheoError> {
        let run = self.repository.get_run(run_id).await?;
        self.oauth
            .ensure_workflow_health(run.workflow_id, None)
            .await?;
        self.oauth.require_healthy(run.workflow_id)?;

        let version = self.repository.get_version(run.workflow_version_id).await?;
        let execution_id = run.id.to_string();
        let cancel = CancelToken::new();
        self.active_runs.insert(execution_id.clone(), cancel.clone());

        let request = RunRequest {
            run_id: run.id,
            workflow_id: run.workflow_id,
            version,
            inputs: run.input_payload.clone(),
            execution_id: execution_id.clone(),
            resolver: Some(CredentialResolver::new(
                self.vault.clone(),
                Some(run.workflow_id),
            )),
            actor: run.triggered_by.clone(),
        };
        let outcome = self.engine.run(request, sink, cancel).await;
        self.active_runs.remove(&execution_id);
        outcome
    }

    /// Convenience wrapper: create and immediately drive a run.
    pub async fn run_workflow(
        &self,
        workflow_id: Uuid,
        inputs: Value,
        triggered_by: &str,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<(Uuid, RunOutcome), OrcheoError> {
        let run = self.create_run(workflow_id, inputs, triggered_by).await?;
        let outcome = self.execute_run(run.id, sink).await?;
        Ok((run.id, outcome))
    }

    /// Trip the cancel token of an in-flight run.
    pub fn cancel_run(&self, execution_id: &str, reason: Option<&str>) -> bool {
        match self.active_runs.get(execution_id) {
            Some(token) => {
                token.trigger(reason);
                true
            }
            None => false,
        }
    }

    /// Paginated trace view over a stored execution.
    pub async fn trace(
        &self,
        execution_id: &str,
        cursor: i64,
        limit: Option<i64>,
    ) -> Result<TraceResponse, OrcheoError> {
        let record = self.history.get(execution_id).await?;
        Ok(trace_response(&record, cursor, limit))
    }

    /// Ingest a sandboxed graph-builder script into a storable graph
    /// payload.
    pub fn ingest_script(
        &self,
        source: &str,
        entrypoint: Option<&str>,
    ) -> Result<Value, OrcheoError> {
        ingest_script(source, entrypoint)
    }

    /// Resolve a published workflow for `/p/<slug>?t=<token>` access:
    /// the raw token is hashed and compared in constant time, and
    /// `require_login` is honoured.
    pub async fn verify_publish_access(
        &self,
        slug: &str,
        token: &str,
        authenticated: bool,
    ) -> Result<Workflow, OrcheoError> {
        let workflow = self.repository.get_workflow_by_slug(slug).await?;
        if !workflow.is_public {
            return Err(OrcheoError::not_found("workflow", slug));
        }
        if !workflow.verify_publish_token(token) {
            return Err(OrcheoError::PublishState(
                "publish token does not match".to_string(),
            ));
        }
        if workflow.require_login && !authenticated {
            return Err(OrcheoError::PublishState(
                "published workflow requires login".to_string(),
            ));
        }
        Ok(workflow)
    }

    /// Validate an inbound webhook event against the workflow's trigger
    /// config; returns the scrubbed header map for trigger metadata.
    pub async fn admit_webhook(
        &self,
        workflow_id: Uuid,
        config: &WebhookTriggerConfig,
        request: &WebhookRequest,
    ) -> Result<BTreeMap<String, String>, OrcheoError> {
        self.webhooks.admit(workflow_id, config, request).await
    }

    pub async fn record_checkpoint(
        &self,
        params: RecordCheckpointParams,
    ) -> Result<AgentensorCheckpoint, OrcheoError> {
        self.checkpoints.record_checkpoint(params).await
    }

    pub async fn list_checkpoints(
        &self,
        workflow_id: &str,
        limit: Option<i64>,
    ) -> Result<Vec<AgentensorCheckpoint>, OrcheoError> {
        self.checkpoints.list_checkpoints(workflow_id, limit).await
    }

    pub async fn latest_checkpoint(
        &self,
        workflow_id: &str,
    ) -> Result<Option<AgentensorCheckpoint>, OrcheoError> {
        self.checkpoints.latest_checkpoint(workflow_id).await
    }

    pub async fn get_checkpoint(
        &self,
        checkpoint_id: &str,
    ) -> Result<AgentensorCheckpoint, OrcheoError> {
        self.checkpoints.get_checkpoint(checkpoint_id).await
    }

    /// The chat store behind the service, for collaborators that need
    /// raw access.
    pub fn chat_store(&self) -> Arc<dyn ChatStore> {
        self.chat.store().clone()
    }
}

impl Drop for Orcheo {
    fn drop(&mut self) {
        self.retention_task.abort();
    }
}
