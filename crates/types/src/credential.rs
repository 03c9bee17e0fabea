//! Credential metadata, encrypted payloads, and issuance templates.

use crate::audit::AuditLog;
use crate::error::OrcheoError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Kind of secret material held by a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialKind {
    Secret,
    Oauth,
    ApiKey,
}

impl CredentialKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialKind::Secret => "SECRET",
            CredentialKind::Oauth => "OAUTH",
            CredentialKind::ApiKey => "API_KEY",
        }
    }
}

/// Who may see and resolve a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialAccess {
    Private,
    Shared,
    Public,
}

impl CredentialAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialAccess::Private => "private",
            CredentialAccess::Shared => "shared",
            CredentialAccess::Public => "public",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CredentialHealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl CredentialHealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialHealthStatus::Healthy => "HEALTHY",
            CredentialHealthStatus::Unhealthy => "UNHEALTHY",
            CredentialHealthStatus::Unknown => "UNKNOWN",
        }
    }
}

/// Last observed health outcome for a credential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialHealth {
    pub status: CredentialHealthStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl Default for CredentialHealth {
    fn default() -> Self {
        CredentialHealth {
            status: CredentialHealthStatus::Unknown,
            last_checked_at: None,
            failure_reason: None,
        }
    }
}

/// Opaque encrypted payload: a versioned envelope carrying nonce,
/// ciphertext, and authentication tag in one encoded string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedSecret {
    pub ciphertext: String,
}

impl EncryptedSecret {
    /// Redacted preview safe for listings: first and last two characters
    /// of the encoded ciphertext, never plaintext.
    pub fn preview(&self) -> String {
        let encoded = &self.ciphertext;
        if encoded.len() <= 4 {
            return "****".to_string();
        }
        format!("{}…{}", &encoded[..2], &encoded[encoded.len() - 2..])
    }
}

/// Decrypted OAuth token bundle stored inside OAUTH-kind credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthTokenSecrets {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub scope: Option<String>,
}

/// Scope a caller resolves credentials from. `workflow_id = None` is the
/// shared/global context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CredentialAccessContext {
    pub workflow_id: Option<Uuid>,
}

impl CredentialAccessContext {
    pub fn for_workflow(workflow_id: Uuid) -> Self {
        CredentialAccessContext {
            workflow_id: Some(workflow_id),
        }
    }
}

/// Stored credential record. The secret is always ciphertext here; only
/// the vault can produce plaintext, and only after a scope check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialMetadata {
    pub id: Uuid,
    pub workflow_id: Option<Uuid>,
    pub name: String,
    pub provider: String,
    pub kind: CredentialKind,
    pub access: CredentialAccess,
    pub scopes: Vec<String>,
    pub template_id: Option<String>,
    pub secret: EncryptedSecret,
    pub health: CredentialHealth,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub owner: String,
    #[serde(default)]
    pub audit_log: AuditLog,
}

impl CredentialMetadata {
    /// Whether the credential shows up in listings for the given context.
    pub fn is_visible(&self, context: &CredentialAccessContext) -> bool {
        if self.access == CredentialAccess::Public {
            return true;
        }
        match self.workflow_id {
            None => true,
            Some(workflow_id) => context.workflow_id == Some(workflow_id),
        }
    }

    /// Enforce that the context may reveal or mutate this credential.
    pub fn ensure_in_scope(&self, context: &CredentialAccessContext) -> Result<(), OrcheoError> {
        if self.is_visible(context) {
            return Ok(());
        }
        Err(OrcheoError::WorkflowScope(format!(
            "credential '{}' is not accessible from workflow {:?}",
            self.name, context.workflow_id
        )))
    }
}

/// Field schema inside a credential template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplateField {
    pub name: String,
    pub label: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub secret: bool,
    pub pattern: Option<String>,
    pub example: Option<String>,
}

/// Schema for issuing credentials of a specific provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialTemplate {
    pub provider: String,
    pub display_name: String,
    pub description: Option<String>,
    pub kind: CredentialKind,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub fields: Vec<TemplateField>,
    pub rotate_after_days: Option<u32>,
    #[serde(default)]
    pub governance_checks: Vec<String>,
}

impl CredentialTemplate {
    /// Check that all required fields are present and non-empty.
    pub fn validate_values(&self, values: &Map<String, Value>) -> Result<(), OrcheoError> {
        for field in &self.fields {
            if !field.required {
                continue;
            }
            let present = values
                .get(&field.name)
                .and_then(Value::as_str)
                .map(|text| !text.trim().is_empty())
                .unwrap_or(false);
            if !present {
                return Err(OrcheoError::Validation(format!(
                    "template '{}' requires field '{}'",
                    self.provider, field.name
                )));
            }
        }
        Ok(())
    }
}
