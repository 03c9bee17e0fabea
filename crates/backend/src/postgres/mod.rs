//! Postgres backends. A shared connection pool with configurable sizing;
//! the schema is created on first connect and the next step ordinal is
//! computed under `SELECT ... FOR UPDATE`.

mod agentensor;
mod chat;
mod credentials;
mod history;
mod repository;

pub use agentensor::PostgresAgentensorCheckpointStore;
pub use chat::PostgresChatStore;
pub use credentials::PostgresCredentialStore;
pub use history::PostgresRunHistoryStore;
pub use repository::PostgresWorkflowRepository;

use orcheo_types::OrcheoError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;

/// Pool sizing knobs surfaced through the backend configuration.
#[derive(Debug, Clone)]
pub struct PgPoolSizing {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout_seconds: u64,
    pub idle_timeout_seconds: u64,
}

impl Default for PgPoolSizing {
    fn default() -> Self {
        PgPoolSizing {
            min_connections: 1,
            max_connections: 8,
            acquire_timeout_seconds: 10,
            idle_timeout_seconds: 300,
        }
    }
}

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        description TEXT,
        tags JSONB NOT NULL DEFAULT '[]'::jsonb,
        is_archived BOOLEAN NOT NULL DEFAULT FALSE,
        is_public BOOLEAN NOT NULL DEFAULT FALSE,
        publish_token_hash TEXT,
        published_at TIMESTAMPTZ,
        published_by TEXT,
        publish_token_rotated_at TIMESTAMPTZ,
        require_login BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        audit_dropped BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS workflow_versions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        version BIGINT NOT NULL,
        graph JSONB NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_by TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        notes TEXT,
        UNIQUE (workflow_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS workflow_runs (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_version_id TEXT NOT NULL,
        status TEXT NOT NULL,
        triggered_by TEXT NOT NULL,
        input_payload JSONB NOT NULL DEFAULT '{}'::jsonb,
        output_payload JSONB,
        started_at TIMESTAMPTZ,
        completed_at TIMESTAMPTZ,
        error TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        audit JSONB NOT NULL DEFAULT '{}'::jsonb
    )",
    "CREATE TABLE IF NOT EXISTS workflow_audit_events (
        entity_id TEXT NOT NULL,
        seq BIGINT NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        at TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        PRIMARY KEY (entity_id, seq)
    )",
    "CREATE TABLE IF NOT EXISTS run_history_runs (
        execution_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        error TEXT,
        inputs JSONB NOT NULL DEFAULT '{}'::jsonb,
        runnable_config JSONB,
        trace_id TEXT,
        trace_started_at TIMESTAMPTZ,
        trace_completed_at TIMESTAMPTZ,
        trace_last_span_at TIMESTAMPTZ
    )",
    "CREATE TABLE IF NOT EXISTS run_history_steps (
        execution_id TEXT NOT NULL,
        ordinal BIGINT NOT NULL,
        at TIMESTAMPTZ NOT NULL,
        payload JSONB NOT NULL,
        PRIMARY KEY (execution_id, ordinal)
    )",
    "CREATE TABLE IF NOT EXISTS chat_threads (
        id TEXT PRIMARY KEY,
        title TEXT,
        status_json JSONB NOT NULL DEFAULT '{}'::jsonb,
        metadata_json JSONB NOT NULL DEFAULT '{}'::jsonb,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chat_messages (
        id TEXT PRIMARY KEY,
        thread_id TEXT NOT NULL,
        ordinal BIGINT NOT NULL,
        item_type TEXT NOT NULL,
        item_json JSONB NOT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        UNIQUE (thread_id, ordinal)
    )",
    "CREATE TABLE IF NOT EXISTS chat_attachments (
        id TEXT PRIMARY KEY,
        thread_id TEXT,
        attachment_type TEXT NOT NULL,
        name TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        details_json JSONB NOT NULL DEFAULT '{}'::jsonb,
        storage_path TEXT,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS credentials (
        id TEXT PRIMARY KEY,
        workflow_id TEXT,
        name TEXT NOT NULL,
        provider TEXT NOT NULL,
        kind TEXT NOT NULL,
        access TEXT NOT NULL,
        scopes JSONB NOT NULL DEFAULT '[]'::jsonb,
        template_id TEXT,
        ciphertext TEXT NOT NULL,
        health_status TEXT NOT NULL DEFAULT 'UNKNOWN',
        health_checked_at TIMESTAMPTZ,
        health_reason TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        updated_at TIMESTAMPTZ NOT NULL,
        owner TEXT NOT NULL,
        audit_dropped BIGINT NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS credential_templates (
        provider TEXT PRIMARY KEY,
        template JSONB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS credential_audit_events (
        entity_id TEXT NOT NULL,
        seq BIGINT NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        at TIMESTAMPTZ NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        PRIMARY KEY (entity_id, seq)
    )",
    "CREATE TABLE IF NOT EXISTS agentensor_checkpoints (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        config_version BIGINT NOT NULL,
        runnable_config JSONB NOT NULL,
        metrics JSONB NOT NULL,
        metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
        artifact_url TEXT,
        is_best BOOLEAN NOT NULL DEFAULT FALSE,
        created_at TIMESTAMPTZ NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_agentensor_checkpoints_workflow
        ON agentensor_checkpoints (workflow_id, config_version)",
    "CREATE INDEX IF NOT EXISTS idx_agentensor_checkpoints_best
        ON agentensor_checkpoints (workflow_id, is_best)",
];

/// Shared handle for all Postgres stores: one pool plus a lazy schema
/// guard evaluated on first connect.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PostgresBackend {
    pub async fn connect(dsn: &str, sizing: &PgPoolSizing) -> Result<Self, OrcheoError> {
        let pool = PgPoolOptions::new()
            .min_connections(sizing.min_connections)
            .max_connections(sizing.max_connections)
            .acquire_timeout(Duration::from_secs(sizing.acquire_timeout_seconds))
            .idle_timeout(Duration::from_secs(sizing.idle_timeout_seconds))
            .connect(dsn)
            .await
            .map_err(db_err)?;
        Ok(PostgresBackend {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) async fn ensure_schema(&self) -> Result<(), OrcheoError> {
        self.schema_ready
            .get_or_try_init(|| async {
                for statement in SCHEMA_STATEMENTS {
                    sqlx::query(statement)
                        .execute(&self.pool)
                        .await
                        .map_err(db_err)?;
                }
                Ok(())
            })
            .await
            .map(|_| ())
    }
}

pub(crate) fn db_err(err: sqlx::Error) -> OrcheoError {
    OrcheoError::RunHistory(err.to_string())
}
