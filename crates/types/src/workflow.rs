//! Workflow, version, and run entities with their lifecycle rules.

use crate::audit::AuditLog;
use crate::canonical::{canonical_json, sha256_hex};
use crate::error::OrcheoError;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use subtle::ConstantTimeEq;
use uuid::Uuid;

const PUBLISH_TOKEN_BYTES: usize = 32;

/// Convert a display name into a lower-kebab slug safe for publish URLs.
pub fn slugify(value: &str) -> String {
    let mut slug = String::with_capacity(value.len());
    let mut previous_dash = true;
    for ch in value.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch);
            previous_dash = false;
        } else if !previous_dash {
            slug.push('-');
            previous_dash = true;
        }
    }
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() {
        Uuid::new_v4().to_string()
    } else {
        slug
    }
}

/// Return a fresh URL-safe publish token with 256 bits of entropy.
pub fn generate_publish_token() -> String {
    let mut bytes = [0u8; PUBLISH_TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// SHA-256 hash of a raw publish token; only the hash is ever persisted.
pub fn hash_publish_token(token: &str) -> String {
    sha256_hex(token.as_bytes())
}

/// Masked form of a hashed publish token suitable for logs and audit
/// metadata: everything but the last six characters is obscured.
pub fn mask_publish_token(token_hash: &str) -> String {
    if token_hash.is_empty() {
        return "publish:unknown".to_string();
    }
    let reveal = 6usize.min(token_hash.len());
    let suffix = &token_hash[token_hash.len() - reveal..];
    let masked_length = token_hash.len().saturating_sub(reveal).max(3);
    format!("publish:{}{}", "*".repeat(masked_length), suffix)
}

/// A versioned graph definition owned by a user. Workflows are archived,
/// never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub is_archived: bool,
    pub is_public: bool,
    pub publish_token_hash: Option<String>,
    pub published_at: Option<DateTime<Utc>>,
    pub published_by: Option<String>,
    pub publish_token_rotated_at: Option<DateTime<Utc>>,
    pub require_login: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub audit_log: AuditLog,
}

impl Workflow {
    pub fn new(
        name: &str,
        description: Option<&str>,
        tags: Vec<String>,
        actor: &str,
    ) -> Result<Self, OrcheoError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(OrcheoError::Validation(
                "workflow name must not be empty".to_string(),
            ));
        }
        let description = description
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string);
        let now = Utc::now();
        let mut workflow = Workflow {
            id: Uuid::new_v4(),
            name: name.to_string(),
            slug: slugify(name),
            description,
            tags: dedupe_tags(tags),
            is_archived: false,
            is_public: false,
            publish_token_hash: None,
            published_at: None,
            published_by: None,
            publish_token_rotated_at: None,
            require_login: false,
            created_at: now,
            updated_at: now,
            audit_log: AuditLog::default(),
        };
        workflow.audit_log.record_action(actor, "workflow_created");
        Ok(workflow)
    }

    /// Mark the workflow as publicly accessible behind the hashed token.
    pub fn publish(
        &mut self,
        token_hash: &str,
        require_login: bool,
        actor: &str,
    ) -> Result<(), OrcheoError> {
        if token_hash.is_empty() {
            return Err(OrcheoError::Validation(
                "publish token hash must be provided".to_string(),
            ));
        }
        if self.is_public {
            return Err(OrcheoError::PublishState(format!(
                "workflow {} is already published",
                self.id
            )));
        }
        let now = Utc::now();
        self.is_public = true;
        self.publish_token_hash = Some(token_hash.to_string());
        self.published_at = Some(now);
        self.published_by = Some(actor.to_string());
        self.publish_token_rotated_at = None;
        self.require_login = require_login;
        self.updated_at = now;
        self.audit_log.record(
            actor,
            "workflow_published",
            json!({
                "require_login": require_login,
                "publish_token_hash": token_hash,
            }),
        );
        Ok(())
    }

    /// Swap the publish token for an already published workflow.
    pub fn rotate_publish_token(
        &mut self,
        token_hash: &str,
        actor: &str,
    ) -> Result<(), OrcheoError> {
        if token_hash.is_empty() {
            return Err(OrcheoError::Validation(
                "publish token hash must be provided".to_string(),
            ));
        }
        let previous = match (self.is_public, &self.publish_token_hash) {
            (true, Some(previous)) => previous.clone(),
            _ => {
                return Err(OrcheoError::PublishState(format!(
                    "workflow {} is not currently published",
                    self.id
                )))
            }
        };
        self.publish_token_hash = Some(token_hash.to_string());
        self.publish_token_rotated_at = Some(Utc::now());
        self.updated_at = Utc::now();
        self.audit_log.record(
            actor,
            "workflow_publish_token_rotated",
            json!({
                "previous_token": mask_publish_token(&previous),
                "new_token": mask_publish_token(token_hash),
            }),
        );
        Ok(())
    }

    /// Revoke public access and clear all publish state.
    pub fn revoke_publish(&mut self, actor: &str) -> Result<(), OrcheoError> {
        if !self.is_public {
            return Err(OrcheoError::PublishState(format!(
                "workflow {} is not currently published",
                self.id
            )));
        }
        let previous = self.publish_token_hash.clone().unwrap_or_default();
        let require_login = self.require_login;
        self.is_public = false;
        self.publish_token_hash = None;
        self.published_at = None;
        self.published_by = None;
        self.publish_token_rotated_at = None;
        self.require_login = false;
        self.updated_at = Utc::now();
        self.audit_log.record(
            actor,
            "workflow_unpublished",
            json!({
                "previous_token": mask_publish_token(&previous),
                "require_login": require_login,
            }),
        );
        Ok(())
    }

    /// Constant-time check of a raw publish token against the stored hash.
    pub fn verify_publish_token(&self, token: &str) -> bool {
        let stored = match &self.publish_token_hash {
            Some(hash) if !token.is_empty() => hash,
            _ => return false,
        };
        let candidate = hash_publish_token(token);
        stored.as_bytes().ct_eq(candidate.as_bytes()).into()
    }

    pub fn archive(&mut self, actor: &str) {
        if !self.is_archived {
            self.is_archived = true;
            self.updated_at = Utc::now();
            self.audit_log.record_action(actor, "workflow_archived");
        }
    }

    pub fn set_tags(&mut self, tags: Vec<String>, actor: &str) {
        self.tags = dedupe_tags(tags);
        self.updated_at = Utc::now();
        self.audit_log.record(actor, "workflow_tags_updated", json!({"tags": self.tags}));
    }
}

fn dedupe_tags(tags: Vec<String>) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut deduped = Vec::new();
    for tag in tags {
        let normalized = tag.trim().to_lowercase();
        if !normalized.is_empty() && seen.insert(normalized.clone()) {
            deduped.push(normalized);
        }
    }
    deduped
}

/// Immutable snapshot of a workflow graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub version: i64,
    pub graph: Value,
    pub metadata: Value,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub notes: Option<String>,
}

impl WorkflowVersion {
    pub fn new(
        workflow_id: Uuid,
        version: i64,
        graph: Value,
        metadata: Value,
        created_by: &str,
        notes: Option<String>,
    ) -> Self {
        WorkflowVersion {
            id: Uuid::new_v4(),
            workflow_id,
            version,
            graph,
            metadata,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            notes,
        }
    }

    /// Deterministic checksum over the canonical-JSON graph encoding.
    pub fn checksum(&self) -> String {
        sha256_hex(canonical_json(&self.graph).as_bytes())
    }
}

/// Lifecycle states for a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl WorkflowRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowRunStatus::Pending => "pending",
            WorkflowRunStatus::Running => "running",
            WorkflowRunStatus::Succeeded => "succeeded",
            WorkflowRunStatus::Failed => "failed",
            WorkflowRunStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkflowRunStatus::Succeeded
                | WorkflowRunStatus::Failed
                | WorkflowRunStatus::Cancelled
        )
    }

    pub fn parse(text: &str) -> Result<Self, OrcheoError> {
        match text {
            "pending" => Ok(WorkflowRunStatus::Pending),
            "running" => Ok(WorkflowRunStatus::Running),
            "succeeded" => Ok(WorkflowRunStatus::Succeeded),
            "failed" => Ok(WorkflowRunStatus::Failed),
            "cancelled" => Ok(WorkflowRunStatus::Cancelled),
            other => Err(OrcheoError::Validation(format!(
                "unknown run status '{other}'"
            ))),
        }
    }
}

/// Runtime record for one execution of a workflow version.
///
/// Once a terminal state is set, every further transition attempt fails
/// with `InvalidTransition`; terminal outcomes are never overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_version_id: Uuid,
    pub status: WorkflowRunStatus,
    pub triggered_by: String,
    pub input_payload: Value,
    pub output_payload: Option<Value>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub audit_log: AuditLog,
}

impl WorkflowRun {
    pub fn new(
        workflow_id: Uuid,
        workflow_version_id: Uuid,
        triggered_by: &str,
        input_payload: Value,
    ) -> Self {
        let mut run = WorkflowRun {
            id: Uuid::new_v4(),
            workflow_id,
            workflow_version_id,
            status: WorkflowRunStatus::Pending,
            triggered_by: triggered_by.to_string(),
            input_payload,
            output_payload: None,
            started_at: None,
            completed_at: None,
            error: None,
            created_at: Utc::now(),
            audit_log: AuditLog::default(),
        };
        run.audit_log.record_action(triggered_by, "run_created");
        run
    }

    pub fn mark_started(&mut self, actor: &str) -> Result<(), OrcheoError> {
        if self.status != WorkflowRunStatus::Pending {
            return Err(OrcheoError::InvalidTransition(format!(
                "only pending runs can be started (run {} is {})",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = WorkflowRunStatus::Running;
        self.started_at = Some(Utc::now());
        self.audit_log.record_action(actor, "run_started");
        Ok(())
    }

    pub fn mark_succeeded(
        &mut self,
        actor: &str,
        output: Option<Value>,
    ) -> Result<(), OrcheoError> {
        if self.status != WorkflowRunStatus::Running {
            return Err(OrcheoError::InvalidTransition(format!(
                "only running runs can be marked succeeded (run {} is {})",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = WorkflowRunStatus::Succeeded;
        self.completed_at = Some(Utc::now());
        self.output_payload = Some(output.unwrap_or_else(|| Value::Object(Map::new())));
        self.error = None;
        self.audit_log.record_action(actor, "run_succeeded");
        Ok(())
    }

    pub fn mark_failed(&mut self, actor: &str, error: &str) -> Result<(), OrcheoError> {
        if !matches!(
            self.status,
            WorkflowRunStatus::Pending | WorkflowRunStatus::Running
        ) {
            return Err(OrcheoError::InvalidTransition(format!(
                "only pending or running runs can be marked failed (run {} is {})",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = WorkflowRunStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error = Some(error.to_string());
        self.audit_log
            .record(actor, "run_failed", json!({"error": error}));
        Ok(())
    }

    pub fn mark_cancelled(
        &mut self,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<(), OrcheoError> {
        if self.status.is_terminal() {
            return Err(OrcheoError::InvalidTransition(format!(
                "cannot cancel run {} from terminal state {}",
                self.id,
                self.status.as_str()
            )));
        }
        self.status = WorkflowRunStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.error = reason.map(str::to_string);
        let metadata = match reason {
            Some(reason) => json!({"reason": reason}),
            None => Value::Object(Map::new()),
        };
        self.audit_log.record(actor, "run_cancelled", metadata);
        Ok(())
    }
}
