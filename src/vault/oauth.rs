//! OAuth credential refresh and health validation service: the
//! pre-execution gate that keeps unhealthy credentials from reaching a
//! run.

use crate::vault::CredentialVault;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use orcheo_types::{
    CredentialAccessContext, CredentialHealthStatus, CredentialKind, CredentialMetadata,
    OAuthTokenSecrets, OrcheoError,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Result returned by providers after validating OAuth credentials.
#[derive(Debug, Clone)]
pub struct OAuthValidationResult {
    pub status: CredentialHealthStatus,
    pub failure_reason: Option<String>,
}

/// Provider-specific refresh and validation hooks. Orcheo ships no
/// provider implementations; the registry is populated at startup.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Return updated tokens, or `None` when no refresh is necessary.
    async fn refresh_tokens(
        &self,
        metadata: &CredentialMetadata,
        tokens: Option<&OAuthTokenSecrets>,
    ) -> Result<Option<OAuthTokenSecrets>, OrcheoError>;

    async fn validate_tokens(
        &self,
        metadata: &CredentialMetadata,
        tokens: Option<&OAuthTokenSecrets>,
    ) -> Result<OAuthValidationResult, OrcheoError>;
}

/// Health outcome for a single credential.
#[derive(Debug, Clone)]
pub struct CredentialHealthResult {
    pub credential_id: Uuid,
    pub name: String,
    pub provider: String,
    pub status: CredentialHealthStatus,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

/// Aggregated health results for all credentials bound to a workflow.
#[derive(Debug, Clone)]
pub struct CredentialHealthReport {
    pub workflow_id: Uuid,
    pub results: Vec<CredentialHealthResult>,
    pub checked_at: DateTime<Utc>,
}

impl CredentialHealthReport {
    pub fn is_healthy(&self) -> bool {
        self.results
            .iter()
            .all(|result| result.status == CredentialHealthStatus::Healthy)
    }

    pub fn failures(&self) -> Vec<String> {
        self.results
            .iter()
            .filter(|result| result.status == CredentialHealthStatus::Unhealthy)
            .map(|result| {
                result.failure_reason.clone().unwrap_or_else(|| {
                    format!("credential {} reported unhealthy", result.credential_id)
                })
            })
            .collect()
    }
}

/// Coordinates OAuth token refresh and health validation. Reports are
/// cached per workflow; `require_healthy` gates execution on the cache.
pub struct OAuthCredentialService {
    vault: Arc<CredentialVault>,
    providers: RwLock<HashMap<String, Arc<dyn OAuthProvider>>>,
    refresh_margin: Duration,
    default_actor: String,
    reports: DashMap<Uuid, CredentialHealthReport>,
}

impl OAuthCredentialService {
    pub fn new(vault: Arc<CredentialVault>, token_ttl_seconds: i64) -> Result<Self, OrcheoError> {
        if token_ttl_seconds <= 0 {
            return Err(OrcheoError::Config(
                "token_ttl_seconds must be greater than zero".to_string(),
            ));
        }
        Ok(OAuthCredentialService {
            vault,
            providers: RwLock::new(HashMap::new()),
            refresh_margin: Duration::seconds(token_ttl_seconds),
            default_actor: "system".to_string(),
            reports: DashMap::new(),
        })
    }

    pub async fn register_provider(&self, provider: &str, handler: Arc<dyn OAuthProvider>) {
        let mut providers = self.providers.write().await;
        providers.insert(provider.to_string(), handler);
    }

    /// True when the cached report has no failures (or none exists yet).
    pub fn is_workflow_healthy(&self, workflow_id: Uuid) -> bool {
        self.reports
            .get(&workflow_id)
            .map(|report| report.is_healthy())
            .unwrap_or(true)
    }

    pub fn get_report(&self, workflow_id: Uuid) -> Option<CredentialHealthReport> {
        self.reports.get(&workflow_id).map(|report| report.clone())
    }

    /// Evaluate and refresh credentials ahead of workflow execution.
    pub async fn ensure_workflow_health(
        &self,
        workflow_id: Uuid,
        actor: Option<&str>,
    ) -> Result<CredentialHealthReport, OrcheoError> {
        let context = CredentialAccessContext::for_workflow(workflow_id);
        let credentials = self.vault.list_credentials(&context).await?;
        let actor = actor.unwrap_or(&self.default_actor).to_string();
        let mut results = Vec::with_capacity(credentials.len());

        for metadata in credentials {
            let result = self.check_credential(&metadata, &actor, &context).await?;
            results.push(result);
        }

        let report = CredentialHealthReport {
            workflow_id,
            results,
            checked_at: Utc::now(),
        };
        self.reports.insert(workflow_id, report.clone());
        Ok(report)
    }

    /// Raise `CredentialHealth` if the cached report deems the workflow
    /// unhealthy. Transport layers call this before dispatching a run.
    pub fn require_healthy(&self, workflow_id: Uuid) -> Result<(), OrcheoError> {
        let Some(report) = self.reports.get(&workflow_id) else {
            return Ok(());
        };
        if report.is_healthy() {
            return Ok(());
        }
        let failures = report.failures().join("; ");
        let failures = if failures.is_empty() {
            "unknown reason".to_string()
        } else {
            failures
        };
        Err(OrcheoError::CredentialHealth(format!(
            "workflow {workflow_id}: {failures}"
        )))
    }

    async fn check_credential(
        &self,
        metadata: &CredentialMetadata,
        actor: &str,
        context: &CredentialAccessContext,
    ) -> Result<CredentialHealthResult, OrcheoError> {
        if metadata.kind != CredentialKind::Oauth {
            let updated = self
                .vault
                .mark_health(
                    metadata.id,
                    CredentialHealthStatus::Healthy,
                    None,
                    actor,
                    context,
                )
                .await?;
            return Ok(health_result(&updated));
        }

        let handler = {
            let providers = self.providers.read().await;
            providers.get(&metadata.provider).cloned()
        };
        let Some(handler) = handler else {
            let updated = self
                .vault
                .mark_health(
                    metadata.id,
                    CredentialHealthStatus::Unhealthy,
                    Some(&format!(
                        "no OAuth provider registered for '{}'",
                        metadata.provider
                    )),
                    actor,
                    context,
                )
                .await?;
            return Ok(health_result(&updated));
        };

        let mut metadata = metadata.clone();
        let mut tokens = self.vault.reveal_oauth_tokens(metadata.id, context).await.ok();

        if self.should_refresh(tokens.as_ref()) {
            match handler.refresh_tokens(&metadata, tokens.as_ref()).await {
                Ok(Some(refreshed)) => {
                    metadata = self
                        .vault
                        .update_oauth_tokens(metadata.id, &refreshed, actor, context)
                        .await?;
                    tokens = Some(refreshed);
                }
                Ok(None) => {}
                Err(err) => {
                    let updated = self
                        .vault
                        .mark_health(
                            metadata.id,
                            CredentialHealthStatus::Unhealthy,
                            Some(&err.to_string()),
                            actor,
                            context,
                        )
                        .await?;
                    return Ok(health_result(&updated));
                }
            }
        }

        let validation = match handler.validate_tokens(&metadata, tokens.as_ref()).await {
            Ok(validation) => validation,
            Err(err) => OAuthValidationResult {
                status: CredentialHealthStatus::Unhealthy,
                failure_reason: Some(err.to_string()),
            },
        };
        let updated = self
            .vault
            .mark_health(
                metadata.id,
                validation.status,
                validation.failure_reason.as_deref(),
                actor,
                context,
            )
            .await?;
        Ok(health_result(&updated))
    }

    fn should_refresh(&self, tokens: Option<&OAuthTokenSecrets>) -> bool {
        match tokens {
            None => true,
            Some(tokens) => match tokens.expires_at {
                None => false,
                Some(expires_at) => expires_at <= Utc::now() + self.refresh_margin,
            },
        }
    }
}

fn health_result(metadata: &CredentialMetadata) -> CredentialHealthResult {
    CredentialHealthResult {
        credential_id: metadata.id,
        name: metadata.name.clone(),
        provider: metadata.provider.clone(),
        status: metadata.health.status,
        last_checked_at: metadata.health.last_checked_at,
        failure_reason: metadata.health.failure_reason.clone(),
    }
}
