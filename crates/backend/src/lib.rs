//! Storage layer for the Orcheo runtime: one async contract per store and
//! three interchangeable backends (in-memory, SQLite, Postgres) selected
//! by a factory at startup.

pub mod memory;
pub mod postgres;
pub mod sqlite;
pub mod store;

pub use postgres::PgPoolSizing;
pub use store::{
    AgentensorCheckpointStore, ChatStore, CredentialStore, RecordCheckpointParams,
    RunHistoryStore, VersionDiff, WorkflowRepository,
};

use orcheo_types::OrcheoError;
use std::path::PathBuf;
use std::sync::Arc;

/// Backend selector read from the runtime configuration.
#[derive(Debug, Clone)]
pub enum BackendConfig {
    InMemory,
    Sqlite { path: PathBuf },
    Postgres { dsn: String, pool: PgPoolSizing },
}

/// Every store of the runtime, wired against one backend.
#[derive(Clone)]
pub struct Backend {
    pub repository: Arc<dyn WorkflowRepository>,
    pub history: Arc<dyn RunHistoryStore>,
    pub chat: Arc<dyn ChatStore>,
    pub checkpoints: Arc<dyn AgentensorCheckpointStore>,
    pub credentials: Arc<dyn CredentialStore>,
}

impl Backend {
    /// Connect the configured backend. SQLite and Postgres defer schema
    /// creation until first use.
    pub async fn connect(config: &BackendConfig) -> Result<Backend, OrcheoError> {
        match config {
            BackendConfig::InMemory => Ok(Backend {
                repository: Arc::new(memory::InMemoryWorkflowRepository::new()),
                history: Arc::new(memory::InMemoryRunHistoryStore::new()),
                chat: Arc::new(memory::InMemoryChatStore::new()),
                checkpoints: Arc::new(memory::InMemoryAgentensorCheckpointStore::new()),
                credentials: Arc::new(memory::InMemoryCredentialStore::new()),
            }),
            BackendConfig::Sqlite { path } => {
                let handle = sqlite::SqliteBackend::connect(path).await?;
                Ok(Backend {
                    repository: Arc::new(sqlite::SqliteWorkflowRepository::new(handle.clone())),
                    history: Arc::new(sqlite::SqliteRunHistoryStore::new(handle.clone())),
                    chat: Arc::new(sqlite::SqliteChatStore::new(handle.clone())),
                    checkpoints: Arc::new(sqlite::SqliteAgentensorCheckpointStore::new(
                        handle.clone(),
                    )),
                    credentials: Arc::new(sqlite::SqliteCredentialStore::new(handle)),
                })
            }
            BackendConfig::Postgres { dsn, pool } => {
                let handle = postgres::PostgresBackend::connect(dsn, pool).await?;
                Ok(Backend {
                    repository: Arc::new(postgres::PostgresWorkflowRepository::new(
                        handle.clone(),
                    )),
                    history: Arc::new(postgres::PostgresRunHistoryStore::new(handle.clone())),
                    chat: Arc::new(postgres::PostgresChatStore::new(handle.clone())),
                    checkpoints: Arc::new(postgres::PostgresAgentensorCheckpointStore::new(
                        handle.clone(),
                    )),
                    credentials: Arc::new(postgres::PostgresCredentialStore::new(handle)),
                })
            }
        }
    }
}
