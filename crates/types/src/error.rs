use thiserror::Error;

/// Error taxonomy shared by every Orcheo subsystem.
///
/// Transport layers map these onto status codes: webhook validation is a
/// 400, webhook authentication a 401, rate limiting a 429, publish-state
/// and transition conflicts a 409, lookups a 404.
#[derive(Debug, Error)]
pub enum OrcheoError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("credential named '{0}' already exists in this scope")]
    NameConflict(String),

    #[error("credential scope violation: {0}")]
    WorkflowScope(String),

    #[error("workflow publish state error: {0}")]
    PublishState(String),

    #[error("run history persistence failed: {0}")]
    RunHistory(String),

    #[error("workflow has unhealthy credentials: {0}")]
    CredentialHealth(String),

    #[error("webhook validation failed: {0}")]
    WebhookValidation(String),

    #[error("webhook authentication failed: {0}")]
    WebhookAuthentication(String),

    #[error("rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    #[error("script ingestion failed: {0}")]
    ScriptIngestion(String),

    #[error("graph definition invalid: {0}")]
    GraphValidation(String),

    #[error("execution failed: {0}")]
    Execution(String),

    #[error("run exceeded its step budget of {0} steps")]
    StepBudgetExceeded(usize),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("serialization failed: {0}")]
    Serialization(String),
}

impl OrcheoError {
    /// Build a `NotFound` error for the given entity kind and identifier.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        OrcheoError::NotFound {
            entity,
            id: id.into(),
        }
    }

    /// True when the error represents a missing entity.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OrcheoError::NotFound { .. })
    }
}

impl From<serde_json::Error> for OrcheoError {
    fn from(err: serde_json::Error) -> Self {
        OrcheoError::Serialization(err.to_string())
    }
}
