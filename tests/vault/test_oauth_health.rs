use async_trait::async_trait;
use chrono::{Duration, Utc};
use orcheo::vault::oauth::{
    OAuthCredentialService, OAuthProvider, OAuthValidationResult,
};
use orcheo::vault::{CreateCredentialParams, CredentialVault, SecretCipher};
use orcheo_backend::memory::InMemoryCredentialStore;
use orcheo_types::{
    CredentialAccess, CredentialAccessContext, CredentialHealthStatus, CredentialKind,
    CredentialMetadata, OAuthTokenSecrets, OrcheoError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

fn vault() -> Arc<CredentialVault> {
    let store = Arc::new(InMemoryCredentialStore::new());
    let cipher = Arc::new(SecretCipher::new("oauth-health-test-key").expect("cipher"));
    Arc::new(CredentialVault::new(store, cipher))
}

async fn oauth_credential(
    vault: &CredentialVault,
    workflow_id: Uuid,
    provider: &str,
    expires_in_seconds: i64,
) -> CredentialMetadata {
    let tokens = OAuthTokenSecrets {
        access_token: "access-0".to_string(),
        refresh_token: Some("refresh-0".to_string()),
        expires_at: Some(Utc::now() + Duration::seconds(expires_in_seconds)),
        scope: Some("chat".to_string()),
    };
    vault
        .create_credential(CreateCredentialParams {
            name: format!("{provider}-oauth"),
            provider: provider.to_string(),
            kind: CredentialKind::Oauth,
            secret: serde_json::to_string(&tokens).expect("tokens"),
            actor: "alice".to_string(),
            workflow_id: Some(workflow_id),
            access: CredentialAccess::Private,
            template_id: None,
            scopes: vec![],
        })
        .await
        .expect("create oauth credential")
}

struct HealthyProvider {
    refreshes: AtomicUsize,
}

#[async_trait]
impl OAuthProvider for HealthyProvider {
    async fn refresh_tokens(
        &self,
        _metadata: &CredentialMetadata,
        tokens: Option<&OAuthTokenSecrets>,
    ) -> Result<Option<OAuthTokenSecrets>, OrcheoError> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(Some(OAuthTokenSecrets {
            access_token: "access-1".to_string(),
            refresh_token: tokens.and_then(|tokens| tokens.refresh_token.clone()),
            expires_at: Some(Utc::now() + Duration::hours(2)),
            scope: tokens.and_then(|tokens| tokens.scope.clone()),
        }))
    }

    async fn validate_tokens(
        &self,
        _metadata: &CredentialMetadata,
        tokens: Option<&OAuthTokenSecrets>,
    ) -> Result<OAuthValidationResult, OrcheoError> {
        let status = if tokens.map(|tokens| tokens.access_token.as_str()) == Some("access-1") {
            CredentialHealthStatus::Healthy
        } else {
            CredentialHealthStatus::Unhealthy
        };
        Ok(OAuthValidationResult {
            status,
            failure_reason: None,
        })
    }
}

struct BrokenProvider;

#[async_trait]
impl OAuthProvider for BrokenProvider {
    async fn refresh_tokens(
        &self,
        _metadata: &CredentialMetadata,
        _tokens: Option<&OAuthTokenSecrets>,
    ) -> Result<Option<OAuthTokenSecrets>, OrcheoError> {
        Err(OrcheoError::Execution("refresh endpoint returned 500".to_string()))
    }

    async fn validate_tokens(
        &self,
        _metadata: &CredentialMetadata,
        _tokens: Option<&OAuthTokenSecrets>,
    ) -> Result<OAuthValidationResult, OrcheoError> {
        Ok(OAuthValidationResult {
            status: CredentialHealthStatus::Healthy,
            failure_reason: None,
        })
    }
}

#[tokio::test]
async fn non_oauth_credentials_are_marked_healthy() {
    let vault = vault();
    let workflow = Uuid::new_v4();
    vault
        .create_credential(CreateCredentialParams {
            name: "plain".to_string(),
            provider: "internal".to_string(),
            kind: CredentialKind::Secret,
            secret: "value".to_string(),
            actor: "alice".to_string(),
            workflow_id: Some(workflow),
            access: CredentialAccess::Private,
            template_id: None,
            scopes: vec![],
        })
        .await
        .expect("create");

    let service = OAuthCredentialService::new(vault, 600).expect("service");
    let report = service
        .ensure_workflow_health(workflow, None)
        .await
        .expect("report");
    assert!(report.is_healthy());
    assert_eq!(report.results.len(), 1);
    assert!(report.results[0].last_checked_at.is_some());
    service.require_healthy(workflow).expect("gate passes");
}

#[tokio::test]
async fn missing_provider_is_unhealthy_and_gates_execution() {
    let vault = vault();
    let workflow = Uuid::new_v4();
    oauth_credential(&vault, workflow, "unregistered", 60).await;

    let service = OAuthCredentialService::new(vault, 600).expect("service");
    let report = service
        .ensure_workflow_health(workflow, None)
        .await
        .expect("report");
    assert!(!report.is_healthy());
    assert!(report.failures()[0].contains("no OAuth provider registered"));

    let err = service.require_healthy(workflow).expect_err("gate blocks");
    assert!(matches!(err, OrcheoError::CredentialHealth(_)));
}

#[tokio::test]
async fn expiring_tokens_are_refreshed_and_persisted() {
    let vault = vault();
    let workflow = Uuid::new_v4();
    let credential = oauth_credential(&vault, workflow, "github", 30).await;

    let provider = Arc::new(HealthyProvider {
        refreshes: AtomicUsize::new(0),
    });
    let service = OAuthCredentialService::new(vault.clone(), 600).expect("service");
    service.register_provider("github", provider.clone()).await;

    let report = service
        .ensure_workflow_health(workflow, None)
        .await
        .expect("report");
    assert!(report.is_healthy());
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);

    // refreshed tokens were re-encrypted into the vault
    let tokens = vault
        .reveal_oauth_tokens(credential.id, &CredentialAccessContext::for_workflow(workflow))
        .await
        .expect("tokens");
    assert_eq!(tokens.access_token, "access-1");

    // a comfortable expiry skips the refresh on the next pass
    let second = service
        .ensure_workflow_health(workflow, None)
        .await
        .expect("report");
    assert!(second.is_healthy());
    assert_eq!(provider.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refresh_errors_surface_as_unhealthy_with_reason() {
    let vault = vault();
    let workflow = Uuid::new_v4();
    oauth_credential(&vault, workflow, "github", 30).await;

    let service = OAuthCredentialService::new(vault, 600).expect("service");
    service.register_provider("github", Arc::new(BrokenProvider)).await;

    let report = service
        .ensure_workflow_health(workflow, None)
        .await
        .expect("report");
    assert!(!report.is_healthy());
    assert!(report.failures()[0].contains("refresh endpoint returned 500"));
    assert!(!service.is_workflow_healthy(workflow));
    assert!(service.get_report(workflow).is_some());
}

#[tokio::test]
async fn ttl_margin_must_be_positive() {
    let vault = vault();
    assert!(OAuthCredentialService::new(vault, 0).is_err());
}
