use super::repository::parse_uuid;
use super::{db_err, PostgresBackend};
use crate::store::CredentialStore;
use async_trait::async_trait;
use orcheo_types::{
    AuditEvent, AuditLog, CredentialAccess, CredentialAccessContext, CredentialHealth,
    CredentialHealthStatus, CredentialKind, CredentialMetadata, CredentialTemplate,
    EncryptedSecret, OrcheoError,
};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{Postgres, Row, Transaction};
use uuid::Uuid;

/// Credential persistence across `credentials`, `credential_templates`,
/// and `credential_audit_events`.
pub struct PostgresCredentialStore {
    backend: PostgresBackend,
}

impl PostgresCredentialStore {
    pub fn new(backend: PostgresBackend) -> Self {
        PostgresCredentialStore { backend }
    }

    async fn load_audit(&self, entity_id: &str, dropped: i64) -> Result<AuditLog, OrcheoError> {
        let rows = sqlx::query(
            "SELECT actor, action, at, metadata FROM credential_audit_events
              WHERE entity_id = $1 ORDER BY seq",
        )
        .bind(entity_id)
        .fetch_all(self.backend.pool())
        .await
        .map_err(db_err)?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(AuditEvent {
                actor: row.try_get("actor").map_err(db_err)?,
                action: row.try_get("action").map_err(db_err)?,
                at: row.try_get("at").map_err(db_err)?,
                metadata: row.try_get("metadata").map_err(db_err)?,
            });
        }
        Ok(AuditLog {
            events,
            dropped: dropped.max(0) as u64,
        })
    }

    async fn row_to_credential(&self, row: &PgRow) -> Result<CredentialMetadata, OrcheoError> {
        let id: String = row.try_get("id").map_err(db_err)?;
        let workflow_id: Option<String> = row.try_get("workflow_id").map_err(db_err)?;
        let kind: String = row.try_get("kind").map_err(db_err)?;
        let access: String = row.try_get("access").map_err(db_err)?;
        let scopes: Value = row.try_get("scopes").map_err(db_err)?;
        let health_status: String = row.try_get("health_status").map_err(db_err)?;
        let dropped: i64 = row.try_get("audit_dropped").map_err(db_err)?;
        let audit_log = self.load_audit(&id, dropped).await?;
        Ok(CredentialMetadata {
            id: parse_uuid(&id)?,
            workflow_id: workflow_id.as_deref().map(parse_uuid).transpose()?,
            name: row.try_get("name").map_err(db_err)?,
            provider: row.try_get("provider").map_err(db_err)?,
            kind: parse_kind(&kind)?,
            access: parse_access(&access)?,
            scopes: serde_json::from_value(scopes)?,
            template_id: row.try_get("template_id").map_err(db_err)?,
            secret: EncryptedSecret {
                ciphertext: row.try_get("ciphertext").map_err(db_err)?,
            },
            health: CredentialHealth {
                status: parse_health(&health_status)?,
                last_checked_at: row.try_get("health_checked_at").map_err(db_err)?,
                failure_reason: row.try_get("health_reason").map_err(db_err)?,
            },
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
            owner: row.try_get("owner").map_err(db_err)?,
            audit_log,
        })
    }
}

fn parse_kind(text: &str) -> Result<CredentialKind, OrcheoError> {
    match text {
        "SECRET" => Ok(CredentialKind::Secret),
        "OAUTH" => Ok(CredentialKind::Oauth),
        "API_KEY" => Ok(CredentialKind::ApiKey),
        other => Err(OrcheoError::Serialization(format!(
            "unknown credential kind '{other}'"
        ))),
    }
}

fn parse_access(text: &str) -> Result<CredentialAccess, OrcheoError> {
    match text {
        "private" => Ok(CredentialAccess::Private),
        "shared" => Ok(CredentialAccess::Shared),
        "public" => Ok(CredentialAccess::Public),
        other => Err(OrcheoError::Serialization(format!(
            "unknown credential access '{other}'"
        ))),
    }
}

fn parse_health(text: &str) -> Result<CredentialHealthStatus, OrcheoError> {
    match text {
        "HEALTHY" => Ok(CredentialHealthStatus::Healthy),
        "UNHEALTHY" => Ok(CredentialHealthStatus::Unhealthy),
        "UNKNOWN" => Ok(CredentialHealthStatus::Unknown),
        other => Err(OrcheoError::Serialization(format!(
            "unknown credential health '{other}'"
        ))),
    }
}

async fn replace_audit(
    tx: &mut Transaction<'_, Postgres>,
    entity_id: &str,
    audit_log: &AuditLog,
) -> Result<(), OrcheoError> {
    sqlx::query("DELETE FROM credential_audit_events WHERE entity_id = $1")
        .bind(entity_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    for (seq, event) in audit_log.events.iter().enumerate() {
        sqlx::query(
            "INSERT INTO credential_audit_events (entity_id, seq, actor, action, at, metadata)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(entity_id)
        .bind(seq as i64)
        .bind(&event.actor)
        .bind(&event.action)
        .bind(event.at)
        .bind(&event.metadata)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

async fn write_credential_row(
    tx: &mut Transaction<'_, Postgres>,
    credential: &CredentialMetadata,
    insert: bool,
) -> Result<(), OrcheoError> {
    let statement = if insert {
        "INSERT INTO credentials (
            id, workflow_id, name, provider, kind, access, scopes, template_id,
            ciphertext, health_status, health_checked_at, health_reason, created_at,
            updated_at, owner, audit_dropped
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
    } else {
        "UPDATE credentials SET
            workflow_id = $2, name = $3, provider = $4, kind = $5, access = $6,
            scopes = $7, template_id = $8, ciphertext = $9, health_status = $10,
            health_checked_at = $11, health_reason = $12, created_at = $13,
            updated_at = $14, owner = $15, audit_dropped = $16
          WHERE id = $1"
    };
    sqlx::query(statement)
        .bind(credential.id.to_string())
        .bind(credential.workflow_id.map(|id| id.to_string()))
        .bind(&credential.name)
        .bind(&credential.provider)
        .bind(credential.kind.as_str())
        .bind(credential.access.as_str())
        .bind(serde_json::to_value(&credential.scopes)?)
        .bind(&credential.template_id)
        .bind(&credential.secret.ciphertext)
        .bind(credential.health.status.as_str())
        .bind(credential.health.last_checked_at)
        .bind(&credential.health.failure_reason)
        .bind(credential.created_at)
        .bind(credential.updated_at)
        .bind(&credential.owner)
        .bind(credential.audit_log.dropped as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    replace_audit(tx, &credential.id.to_string(), &credential.audit_log).await
}

#[async_trait]
impl CredentialStore for PostgresCredentialStore {
    async fn insert(
        &self,
        credential: CredentialMetadata,
    ) -> Result<CredentialMetadata, OrcheoError> {
        self.backend.ensure_schema().await?;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let conflict = sqlx::query(
            "SELECT 1 FROM credentials
              WHERE name = $1 AND workflow_id IS NOT DISTINCT FROM $2",
        )
        .bind(&credential.name)
        .bind(credential.workflow_id.map(|id| id.to_string()))
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_err)?;
        if conflict.is_some() {
            return Err(OrcheoError::NameConflict(credential.name));
        }
        write_credential_row(&mut tx, &credential, true).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(credential)
    }

    async fn get(&self, id: Uuid) -> Result<CredentialMetadata, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM credentials WHERE id = $1")
            .bind(id.to_string())
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("credential", id.to_string()))?;
        self.row_to_credential(&row).await
    }

    async fn update(
        &self,
        credential: CredentialMetadata,
    ) -> Result<CredentialMetadata, OrcheoError> {
        self.backend.ensure_schema().await?;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let exists = sqlx::query("SELECT 1 FROM credentials WHERE id = $1 FOR UPDATE")
            .bind(credential.id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(OrcheoError::not_found(
                "credential",
                credential.id.to_string(),
            ));
        }
        write_credential_row(&mut tx, &credential, false).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(credential)
    }

    async fn delete(&self, id: Uuid) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let result = sqlx::query("DELETE FROM credentials WHERE id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(OrcheoError::not_found("credential", id.to_string()));
        }
        sqlx::query("DELETE FROM credential_audit_events WHERE entity_id = $1")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)
    }

    async fn list_all(&self) -> Result<Vec<CredentialMetadata>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let rows = sqlx::query("SELECT * FROM credentials ORDER BY created_at")
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err)?;
        let mut credentials = Vec::with_capacity(rows.len());
        for row in &rows {
            credentials.push(self.row_to_credential(row).await?);
        }
        Ok(credentials)
    }

    async fn list_visible(
        &self,
        context: &CredentialAccessContext,
    ) -> Result<Vec<CredentialMetadata>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let rows = match context.workflow_id {
            Some(workflow_id) => sqlx::query(
                "SELECT * FROM credentials
                  WHERE access = 'public' OR workflow_id IS NULL OR workflow_id = $1
                  ORDER BY created_at",
            )
            .bind(workflow_id.to_string())
            .fetch_all(self.backend.pool())
            .await,
            None => sqlx::query(
                "SELECT * FROM credentials
                  WHERE access = 'public' OR workflow_id IS NULL
                  ORDER BY created_at",
            )
            .fetch_all(self.backend.pool())
            .await,
        }
        .map_err(db_err)?;
        let mut credentials = Vec::with_capacity(rows.len());
        for row in &rows {
            credentials.push(self.row_to_credential(row).await?);
        }
        Ok(credentials)
    }

    async fn upsert_template(&self, template: CredentialTemplate) -> Result<(), OrcheoError> {
        self.backend.ensure_schema().await?;
        sqlx::query(
            "INSERT INTO credential_templates (provider, template) VALUES ($1, $2)
             ON CONFLICT (provider) DO UPDATE SET template = excluded.template",
        )
        .bind(&template.provider)
        .bind(serde_json::to_value(&template)?)
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn get_template(&self, provider: &str) -> Result<CredentialTemplate, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT template FROM credential_templates WHERE provider = $1")
            .bind(provider)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("credential template", provider))?;
        let template: Value = row.try_get("template").map_err(db_err)?;
        serde_json::from_value(template).map_err(OrcheoError::from)
    }

    async fn list_templates(&self) -> Result<Vec<CredentialTemplate>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let rows = sqlx::query("SELECT template FROM credential_templates ORDER BY provider")
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err)?;
        rows.iter()
            .map(|row| {
                let template: Value = row.try_get("template").map_err(db_err)?;
                serde_json::from_value(template).map_err(OrcheoError::from)
            })
            .collect()
    }
}
