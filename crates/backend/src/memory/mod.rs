//! In-memory backends: a mutex-guarded state struct per store. Useful for
//! tests and single-process development setups.

mod agentensor;
mod chat;
mod credentials;
mod history;
mod repository;

pub use agentensor::InMemoryAgentensorCheckpointStore;
pub use chat::InMemoryChatStore;
pub use credentials::InMemoryCredentialStore;
pub use history::InMemoryRunHistoryStore;
pub use repository::InMemoryWorkflowRepository;
