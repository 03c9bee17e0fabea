//! Encrypted credential vault: scoped storage, audited mutations, and
//! the only bridge from graph config to plaintext secrets.

mod cipher;
pub mod oauth;
mod resolver;

pub use cipher::SecretCipher;
pub use resolver::CredentialResolver;

use chrono::Utc;
use dashmap::DashMap;
use orcheo_backend::CredentialStore;
use orcheo_types::{
    CredentialAccess, CredentialAccessContext, CredentialHealth, CredentialHealthStatus,
    CredentialKind, CredentialMetadata, CredentialTemplate, OAuthTokenSecrets, OrcheoError,
};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Parameters for issuing a new credential.
#[derive(Debug, Clone)]
pub struct CreateCredentialParams {
    pub name: String,
    pub provider: String,
    pub kind: CredentialKind,
    pub secret: String,
    pub actor: String,
    pub workflow_id: Option<Uuid>,
    pub access: CredentialAccess,
    pub template_id: Option<String>,
    pub scopes: Vec<String>,
}

/// Credential vault over a pluggable store and cipher. All mutations are
/// audited; reads enforce workflow scoping.
pub struct CredentialVault {
    store: Arc<dyn CredentialStore>,
    cipher: Arc<SecretCipher>,
    // Single writer per credential; readers go straight to the store.
    locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl CredentialVault {
    pub fn new(store: Arc<dyn CredentialStore>, cipher: Arc<SecretCipher>) -> Self {
        CredentialVault {
            store,
            cipher,
            locks: DashMap::new(),
        }
    }

    pub fn cipher(&self) -> &SecretCipher {
        &self.cipher
    }

    fn lock_for(&self, credential_id: Uuid) -> Arc<Mutex<()>> {
        self.locks
            .entry(credential_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn create_credential(
        &self,
        params: CreateCredentialParams,
    ) -> Result<CredentialMetadata, OrcheoError> {
        let name = params.name.trim();
        if name.is_empty() {
            return Err(OrcheoError::Validation(
                "credential name must not be empty".to_string(),
            ));
        }
        if let Some(template_id) = &params.template_id {
            let template = self.store.get_template(template_id).await?;
            if template.kind != params.kind {
                return Err(OrcheoError::Validation(format!(
                    "template '{template_id}' issues {} credentials, not {}",
                    template.kind.as_str(),
                    params.kind.as_str()
                )));
            }
        }
        let secret = self.cipher.encrypt(&params.secret)?;
        let now = Utc::now();
        let mut credential = CredentialMetadata {
            id: Uuid::new_v4(),
            workflow_id: params.workflow_id,
            name: name.to_string(),
            provider: params.provider,
            kind: params.kind,
            access: params.access,
            scopes: params.scopes,
            template_id: params.template_id,
            secret,
            health: CredentialHealth::default(),
            created_at: now,
            updated_at: now,
            owner: params.actor.clone(),
            audit_log: Default::default(),
        };
        credential
            .audit_log
            .record_action(&params.actor, "credential_created");
        self.store.insert(credential).await
    }

    /// Credentials visible in the context. Secrets stay encrypted; use
    /// `EncryptedSecret::preview` for listings.
    pub async fn list_credentials(
        &self,
        context: &CredentialAccessContext,
    ) -> Result<Vec<CredentialMetadata>, OrcheoError> {
        self.store.list_visible(context).await
    }

    pub async fn get_credential(
        &self,
        credential_id: Uuid,
        context: &CredentialAccessContext,
    ) -> Result<CredentialMetadata, OrcheoError> {
        let credential = self.store.get(credential_id).await?;
        credential.ensure_in_scope(context)?;
        Ok(credential)
    }

    /// Decrypt the stored secret after enforcing scope.
    pub async fn reveal_secret(
        &self,
        credential_id: Uuid,
        context: &CredentialAccessContext,
    ) -> Result<String, OrcheoError> {
        let credential = self.get_credential(credential_id, context).await?;
        self.cipher.decrypt(&credential.secret)
    }

    /// Decrypt and parse the OAuth token bundle of an OAUTH credential.
    pub async fn reveal_oauth_tokens(
        &self,
        credential_id: Uuid,
        context: &CredentialAccessContext,
    ) -> Result<OAuthTokenSecrets, OrcheoError> {
        let credential = self.get_credential(credential_id, context).await?;
        if credential.kind != CredentialKind::Oauth {
            return Err(OrcheoError::Validation(format!(
                "credential '{}' is not an OAuth credential",
                credential.name
            )));
        }
        let plaintext = self.cipher.decrypt(&credential.secret)?;
        serde_json::from_str(&plaintext).map_err(OrcheoError::from)
    }

    pub async fn update_secret(
        &self,
        credential_id: Uuid,
        secret: &str,
        actor: &str,
        context: &CredentialAccessContext,
    ) -> Result<CredentialMetadata, OrcheoError> {
        let lock = self.lock_for(credential_id);
        let _guard = lock.lock().await;
        let mut credential = self.get_credential(credential_id, context).await?;
        credential.secret = self.cipher.encrypt(secret)?;
        credential.updated_at = Utc::now();
        credential.audit_log.record_action(actor, "credential_secret_updated");
        self.store.update(credential).await
    }

    pub async fn delete_credential(
        &self,
        credential_id: Uuid,
        actor: &str,
        context: &CredentialAccessContext,
    ) -> Result<(), OrcheoError> {
        let lock = self.lock_for(credential_id);
        let _guard = lock.lock().await;
        let credential = self.get_credential(credential_id, context).await?;
        tracing::info!(
            credential = %credential.name,
            actor,
            "deleting credential"
        );
        self.store.delete(credential_id).await?;
        self.locks.remove(&credential_id);
        Ok(())
    }

    pub async fn mark_health(
        &self,
        credential_id: Uuid,
        status: CredentialHealthStatus,
        reason: Option<&str>,
        actor: &str,
        context: &CredentialAccessContext,
    ) -> Result<CredentialMetadata, OrcheoError> {
        let lock = self.lock_for(credential_id);
        let _guard = lock.lock().await;
        let mut credential = self.get_credential(credential_id, context).await?;
        credential.health = CredentialHealth {
            status,
            last_checked_at: Some(Utc::now()),
            failure_reason: reason.map(str::to_string),
        };
        credential.updated_at = Utc::now();
        credential.audit_log.record(
            actor,
            "credential_health_checked",
            json!({"status": status.as_str(), "reason": reason}),
        );
        self.store.update(credential).await
    }

    pub async fn update_oauth_tokens(
        &self,
        credential_id: Uuid,
        tokens: &OAuthTokenSecrets,
        actor: &str,
        context: &CredentialAccessContext,
    ) -> Result<CredentialMetadata, OrcheoError> {
        let lock = self.lock_for(credential_id);
        let _guard = lock.lock().await;
        let mut credential = self.get_credential(credential_id, context).await?;
        if credential.kind != CredentialKind::Oauth {
            return Err(OrcheoError::Validation(format!(
                "credential '{}' is not an OAuth credential",
                credential.name
            )));
        }
        let serialized = serde_json::to_string(tokens)?;
        credential.secret = self.cipher.encrypt(&serialized)?;
        credential.updated_at = Utc::now();
        credential
            .audit_log
            .record_action(actor, "credential_oauth_tokens_rotated");
        self.store.update(credential).await
    }

    /// Resolve a credential reference by name within the context,
    /// preferring the context's own workflow scope over shared/public
    /// matches.
    pub async fn resolve_plaintext(
        &self,
        name: &str,
        context: &CredentialAccessContext,
    ) -> Result<String, OrcheoError> {
        let visible = self.store.list_visible(context).await?;
        let mut fallback: Option<&CredentialMetadata> = None;
        for credential in &visible {
            if credential.name != name {
                continue;
            }
            if credential.workflow_id.is_some()
                && credential.workflow_id == context.workflow_id
            {
                return self.cipher.decrypt(&credential.secret);
            }
            fallback.get_or_insert(credential);
        }
        match fallback {
            Some(credential) => self.cipher.decrypt(&credential.secret),
            None => Err(OrcheoError::not_found("credential", name)),
        }
    }

    pub async fn upsert_template(&self, template: CredentialTemplate) -> Result<(), OrcheoError> {
        self.store.upsert_template(template).await
    }

    pub async fn get_template(&self, provider: &str) -> Result<CredentialTemplate, OrcheoError> {
        self.store.get_template(provider).await
    }

    pub async fn list_templates(&self) -> Result<Vec<CredentialTemplate>, OrcheoError> {
        self.store.list_templates().await
    }
}
