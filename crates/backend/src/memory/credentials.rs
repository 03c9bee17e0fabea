use crate::store::CredentialStore;
use async_trait::async_trait;
use orcheo_types::{
    CredentialAccessContext, CredentialMetadata, CredentialTemplate, OrcheoError,
};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct CredentialState {
    credentials: HashMap<Uuid, CredentialMetadata>,
    templates: HashMap<String, CredentialTemplate>,
}

/// Credential persistence backed by process-local maps.
#[derive(Default)]
pub struct InMemoryCredentialStore {
    state: Mutex<CredentialState>,
}

impl InMemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for InMemoryCredentialStore {
    async fn insert(
        &self,
        credential: CredentialMetadata,
    ) -> Result<CredentialMetadata, OrcheoError> {
        let mut state = self.state.lock().await;
        let conflict = state.credentials.values().any(|existing| {
            existing.name == credential.name && existing.workflow_id == credential.workflow_id
        });
        if conflict {
            return Err(OrcheoError::NameConflict(credential.name));
        }
        state.credentials.insert(credential.id, credential.clone());
        Ok(credential)
    }

    async fn get(&self, id: Uuid) -> Result<CredentialMetadata, OrcheoError> {
        let state = self.state.lock().await;
        state
            .credentials
            .get(&id)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("credential", id.to_string()))
    }

    async fn update(
        &self,
        credential: CredentialMetadata,
    ) -> Result<CredentialMetadata, OrcheoError> {
        let mut state = self.state.lock().await;
        if !state.credentials.contains_key(&credential.id) {
            return Err(OrcheoError::not_found(
                "credential",
                credential.id.to_string(),
            ));
        }
        state.credentials.insert(credential.id, credential.clone());
        Ok(credential)
    }

    async fn delete(&self, id: Uuid) -> Result<(), OrcheoError> {
        let mut state = self.state.lock().await;
        state
            .credentials
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| OrcheoError::not_found("credential", id.to_string()))
    }

    async fn list_all(&self) -> Result<Vec<CredentialMetadata>, OrcheoError> {
        let state = self.state.lock().await;
        let mut credentials: Vec<CredentialMetadata> =
            state.credentials.values().cloned().collect();
        credentials.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(credentials)
    }

    async fn list_visible(
        &self,
        context: &CredentialAccessContext,
    ) -> Result<Vec<CredentialMetadata>, OrcheoError> {
        let mut credentials = self.list_all().await?;
        credentials.retain(|credential| credential.is_visible(context));
        Ok(credentials)
    }

    async fn upsert_template(&self, template: CredentialTemplate) -> Result<(), OrcheoError> {
        let mut state = self.state.lock().await;
        state.templates.insert(template.provider.clone(), template);
        Ok(())
    }

    async fn get_template(&self, provider: &str) -> Result<CredentialTemplate, OrcheoError> {
        let state = self.state.lock().await;
        state
            .templates
            .get(provider)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("credential template", provider))
    }

    async fn list_templates(&self) -> Result<Vec<CredentialTemplate>, OrcheoError> {
        let state = self.state.lock().await;
        let mut templates: Vec<CredentialTemplate> = state.templates.values().cloned().collect();
        templates.sort_by(|a, b| a.provider.cmp(&b.provider));
        Ok(templates)
    }
}
