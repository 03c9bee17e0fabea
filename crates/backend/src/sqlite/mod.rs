//! SQLite backends. One file is owned by a single process, so writes are
//! serialised through an in-process mutex on top of WAL journaling. The
//! schema is created lazily on first use, with a forward-only migration
//! for pre-`thread_id` chat message tables.

mod agentensor;
mod chat;
mod credentials;
mod history;
mod repository;

pub use agentensor::SqliteAgentensorCheckpointStore;
pub use chat::SqliteChatStore;
pub use credentials::SqliteCredentialStore;
pub use history::SqliteRunHistoryStore;
pub use repository::SqliteWorkflowRepository;

use chrono::{DateTime, SecondsFormat, Utc};
use orcheo_types::OrcheoError;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};

const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        slug TEXT NOT NULL UNIQUE,
        description TEXT,
        tags_json TEXT NOT NULL DEFAULT '[]',
        is_archived INTEGER NOT NULL DEFAULT 0,
        is_public INTEGER NOT NULL DEFAULT 0,
        publish_token_hash TEXT,
        published_at TEXT,
        published_by TEXT,
        publish_token_rotated_at TEXT,
        require_login INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        audit_dropped INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS workflow_versions (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        version INTEGER NOT NULL,
        graph_json TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_by TEXT NOT NULL,
        created_at TEXT NOT NULL,
        notes TEXT,
        UNIQUE (workflow_id, version)
    )",
    "CREATE TABLE IF NOT EXISTS workflow_runs (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        workflow_version_id TEXT NOT NULL,
        status TEXT NOT NULL,
        triggered_by TEXT NOT NULL,
        input_json TEXT NOT NULL DEFAULT '{}',
        output_json TEXT,
        started_at TEXT,
        completed_at TEXT,
        error TEXT,
        created_at TEXT NOT NULL,
        audit_json TEXT NOT NULL DEFAULT '{}'
    )",
    "CREATE TABLE IF NOT EXISTS workflow_audit_events (
        entity_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        at TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (entity_id, seq)
    )",
    "CREATE TABLE IF NOT EXISTS run_history_runs (
        execution_id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        completed_at TEXT,
        error TEXT,
        inputs_json TEXT NOT NULL DEFAULT '{}',
        runnable_config_json TEXT,
        trace_id TEXT,
        trace_started_at TEXT,
        trace_completed_at TEXT,
        trace_last_span_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS run_history_steps (
        execution_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        at TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        PRIMARY KEY (execution_id, ordinal)
    )",
    "CREATE TABLE IF NOT EXISTS chat_threads (
        id TEXT PRIMARY KEY,
        title TEXT,
        status_json TEXT NOT NULL DEFAULT '{}',
        metadata_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS chat_messages (
        id TEXT PRIMARY KEY,
        thread_id TEXT NOT NULL,
        ordinal INTEGER NOT NULL,
        item_type TEXT NOT NULL,
        item_json TEXT NOT NULL,
        created_at TEXT NOT NULL,
        UNIQUE (thread_id, ordinal)
    )",
    "CREATE TABLE IF NOT EXISTS chat_attachments (
        id TEXT PRIMARY KEY,
        thread_id TEXT,
        attachment_type TEXT NOT NULL,
        name TEXT NOT NULL,
        mime_type TEXT NOT NULL,
        details_json TEXT NOT NULL DEFAULT '{}',
        storage_path TEXT,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS credentials (
        id TEXT PRIMARY KEY,
        workflow_id TEXT,
        name TEXT NOT NULL,
        provider TEXT NOT NULL,
        kind TEXT NOT NULL,
        access TEXT NOT NULL,
        scopes_json TEXT NOT NULL DEFAULT '[]',
        template_id TEXT,
        ciphertext TEXT NOT NULL,
        health_status TEXT NOT NULL DEFAULT 'UNKNOWN',
        health_checked_at TEXT,
        health_reason TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        owner TEXT NOT NULL,
        audit_dropped INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS credential_templates (
        provider TEXT PRIMARY KEY,
        template_json TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS credential_audit_events (
        entity_id TEXT NOT NULL,
        seq INTEGER NOT NULL,
        actor TEXT NOT NULL,
        action TEXT NOT NULL,
        at TEXT NOT NULL,
        metadata_json TEXT NOT NULL DEFAULT '{}',
        PRIMARY KEY (entity_id, seq)
    )",
    "CREATE TABLE IF NOT EXISTS agentensor_checkpoints (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        config_version INTEGER NOT NULL,
        runnable_config TEXT NOT NULL,
        metrics TEXT NOT NULL,
        metadata TEXT NOT NULL DEFAULT '{}',
        artifact_url TEXT,
        is_best INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_agentensor_checkpoints_workflow
        ON agentensor_checkpoints (workflow_id, config_version)",
    "CREATE INDEX IF NOT EXISTS idx_agentensor_checkpoints_best
        ON agentensor_checkpoints (workflow_id, is_best)",
];

/// Shared handle for all SQLite stores: one pool, one writer mutex, one
/// lazy schema guard.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
    schema_ready: Arc<OnceCell<()>>,
}

impl SqliteBackend {
    pub async fn connect(path: &Path) -> Result<Self, OrcheoError> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .map_err(db_err)?;
        Ok(SqliteBackend {
            pool,
            writer: Arc::new(Mutex::new(())),
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn writer(&self) -> &Mutex<()> {
        &self.writer
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
                migrate_chat_messages_thread_id(&self.pool).await
            })
            .await
            .map(|_| ())
    }
}

/// Forward-only migration: legacy deployments created `chat_messages`
/// without a `thread_id` column; add it and back-fill from the item
/// payload, which always embeds its containing thread.
async fn migrate_chat_messages_thread_id(pool: &SqlitePool) -> Result<(), OrcheoError> {
    let columns = sqlx::query("PRAGMA table_info(chat_messages)")
        .fetch_all(pool)
        .await
        .map_err(db_err)?;
    let has_thread_id = columns.iter().any(|row| {
        row.try_get::<String, _>("name")
            .map(|name| name == "thread_id")
            .unwrap_or(false)
    });
    if has_thread_id {
        return Ok(());
    }
    tracing::info!("adding thread_id column to chat_messages");
    sqlx::query("ALTER TABLE chat_messages ADD COLUMN thread_id TEXT NOT NULL DEFAULT ''")
        .execute(pool)
        .await
        .map_err(db_err)?;
    sqlx::query(
        "UPDATE chat_messages
            SET thread_id = COALESCE(json_extract(item_json, '$.thread_id'), '')
          WHERE thread_id = ''",
    )
    .execute(pool)
    .await
    .map_err(db_err)?;
    Ok(())
}

pub(crate) fn db_err(err: sqlx::Error) -> OrcheoError {
    OrcheoError::RunHistory(err.to_string())
}

pub(crate) fn encode_ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn encode_opt_ts(at: &Option<DateTime<Utc>>) -> Option<String> {
    at.as_ref().map(encode_ts)
}

pub(crate) fn decode_ts(text: &str) -> Result<DateTime<Utc>, OrcheoError> {
    DateTime::parse_from_rfc3339(text)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| OrcheoError::Serialization(format!("invalid timestamp '{text}': {err}")))
}

pub(crate) fn decode_opt_ts(text: Option<String>) -> Result<Option<DateTime<Utc>>, OrcheoError> {
    text.as_deref().map(decode_ts).transpose()
}

pub(crate) fn encode_json(value: &Value) -> Result<String, OrcheoError> {
    serde_json::to_string(value).map_err(OrcheoError::from)
}

pub(crate) fn decode_json(text: &str) -> Result<Value, OrcheoError> {
    serde_json::from_str(text).map_err(OrcheoError::from)
}
