//! Core entity types shared across the Orcheo runtime crates.

pub mod agentensor;
pub mod audit;
pub mod canonical;
pub mod chat;
pub mod credential;
pub mod error;
pub mod run_history;
pub mod webhook;
pub mod workflow;

pub use agentensor::AgentensorCheckpoint;
pub use audit::{AuditEvent, AuditLog, MAX_AUDIT_EVENTS};
pub use canonical::{canonical_json, canonical_json_pretty, diff_lines, sha256_hex};
pub use chat::{ChatAttachment, Page, SortOrder, ThreadItem, ThreadMetadata};
pub use credential::{
    CredentialAccess, CredentialAccessContext, CredentialHealth, CredentialHealthStatus,
    CredentialKind, CredentialMetadata, CredentialTemplate, EncryptedSecret, OAuthTokenSecrets,
    TemplateField,
};
pub use error::OrcheoError;
pub use run_history::{
    RunHistoryRecord, RunHistoryStatus, RunHistoryStep, RunStartRequest, TraceMetadataUpdate,
};
pub use webhook::{HmacAlgorithm, WebhookRateLimit, WebhookTriggerConfig};
pub use workflow::{
    generate_publish_token, hash_publish_token, mask_publish_token, slugify, Workflow,
    WorkflowRun, WorkflowRunStatus, WorkflowVersion,
};
