use super::{db_err, decode_json, decode_opt_ts, decode_ts, encode_json, encode_opt_ts, encode_ts, SqliteBackend};
use crate::store::WorkflowRepository;
use async_trait::async_trait;
use orcheo_types::{
    AuditEvent, AuditLog, OrcheoError, Workflow, WorkflowRun, WorkflowRunStatus, WorkflowVersion,
};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use uuid::Uuid;

/// Workflow repository persisted across `workflows`, `workflow_versions`,
/// `workflow_runs`, and `workflow_audit_events`.
pub struct SqliteWorkflowRepository {
    backend: SqliteBackend,
}

impl SqliteWorkflowRepository {
    pub fn new(backend: SqliteBackend) -> Self {
        SqliteWorkflowRepository { backend }
    }

    async fn load_audit(&self, entity_id: &str, dropped: i64) -> Result<AuditLog, OrcheoError> {
        let rows = sqlx::query(
            "SELECT actor, action, at, metadata_json FROM workflow_audit_events
              WHERE entity_id = ? ORDER BY seq",
        )
        .bind(entity_id)
        .fetch_all(self.backend.pool())
        .await
        .map_err(db_err)?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            let at: String = row.try_get("at").map_err(db_err)?;
            let metadata_json: String = row.try_get("metadata_json").map_err(db_err)?;
            events.push(AuditEvent {
                actor: row.try_get("actor").map_err(db_err)?,
                action: row.try_get("action").map_err(db_err)?,
                at: decode_ts(&at)?,
                metadata: decode_json(&metadata_json)?,
            });
        }
        Ok(AuditLog {
            events,
            dropped: dropped.max(0) as u64,
        })
    }

    async fn row_to_workflow(&self, row: &SqliteRow) -> Result<Workflow, OrcheoError> {
        let id: String = row.try_get("id").map_err(db_err)?;
        let tags_json: String = row.try_get("tags_json").map_err(db_err)?;
        let created_at: String = row.try_get("created_at").map_err(db_err)?;
        let updated_at: String = row.try_get("updated_at").map_err(db_err)?;
        let dropped: i64 = row.try_get("audit_dropped").map_err(db_err)?;
        let audit_log = self.load_audit(&id, dropped).await?;
        Ok(Workflow {
            id: parse_uuid(&id)?,
            name: row.try_get("name").map_err(db_err)?,
            slug: row.try_get("slug").map_err(db_err)?,
            description: row.try_get("description").map_err(db_err)?,
            tags: serde_json::from_str(&tags_json)?,
            is_archived: row.try_get("is_archived").map_err(db_err)?,
            is_public: row.try_get("is_public").map_err(db_err)?,
            publish_token_hash: row.try_get("publish_token_hash").map_err(db_err)?,
            published_at: decode_opt_ts(row.try_get("published_at").map_err(db_err)?)?,
            published_by: row.try_get("published_by").map_err(db_err)?,
            publish_token_rotated_at: decode_opt_ts(
                row.try_get("publish_token_rotated_at").map_err(db_err)?,
            )?,
            require_login: row.try_get("require_login").map_err(db_err)?,
            created_at: decode_ts(&created_at)?,
            updated_at: decode_ts(&updated_at)?,
            audit_log,
        })
    }
}

pub(super) fn parse_uuid(text: &str) -> Result<Uuid, OrcheoError> {
    Uuid::parse_str(text)
        .map_err(|err| OrcheoError::Serialization(format!("invalid uuid '{text}': {err}")))
}

async fn replace_audit(
    tx: &mut Transaction<'_, Sqlite>,
    entity_id: &str,
    audit_log: &AuditLog,
) -> Result<(), OrcheoError> {
    sqlx::query("DELETE FROM workflow_audit_events WHERE entity_id = ?")
        .bind(entity_id)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    for (seq, event) in audit_log.events.iter().enumerate() {
        sqlx::query(
            "INSERT INTO workflow_audit_events (entity_id, seq, actor, action, at, metadata_json)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(entity_id)
        .bind(seq as i64)
        .bind(&event.actor)
        .bind(&event.action)
        .bind(encode_ts(&event.at))
        .bind(encode_json(&event.metadata)?)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    }
    Ok(())
}

async fn write_workflow_row(
    tx: &mut Transaction<'_, Sqlite>,
    workflow: &Workflow,
    insert: bool,
) -> Result<(), OrcheoError> {
    let statement = if insert {
        "INSERT INTO workflows (
            id, name, slug, description, tags_json, is_archived, is_public,
            publish_token_hash, published_at, published_by, publish_token_rotated_at,
            require_login, created_at, updated_at, audit_dropped
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
    } else {
        "UPDATE workflows SET
            name = ?2, slug = ?3, description = ?4, tags_json = ?5, is_archived = ?6,
            is_public = ?7, publish_token_hash = ?8, published_at = ?9, published_by = ?10,
            publish_token_rotated_at = ?11, require_login = ?12, created_at = ?13,
            updated_at = ?14, audit_dropped = ?15
          WHERE id = ?1"
    };
    sqlx::query(statement)
        .bind(workflow.id.to_string())
        .bind(&workflow.name)
        .bind(&workflow.slug)
        .bind(&workflow.description)
        .bind(serde_json::to_string(&workflow.tags)?)
        .bind(workflow.is_archived)
        .bind(workflow.is_public)
        .bind(&workflow.publish_token_hash)
        .bind(encode_opt_ts(&workflow.published_at))
        .bind(&workflow.published_by)
        .bind(encode_opt_ts(&workflow.publish_token_rotated_at))
        .bind(workflow.require_login)
        .bind(encode_ts(&workflow.created_at))
        .bind(encode_ts(&workflow.updated_at))
        .bind(workflow.audit_log.dropped as i64)
        .execute(&mut **tx)
        .await
        .map_err(db_err)?;
    replace_audit(tx, &workflow.id.to_string(), &workflow.audit_log).await
}

fn row_to_version(row: &SqliteRow) -> Result<WorkflowVersion, OrcheoError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let workflow_id: String = row.try_get("workflow_id").map_err(db_err)?;
    let graph_json: String = row.try_get("graph_json").map_err(db_err)?;
    let metadata_json: String = row.try_get("metadata_json").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    Ok(WorkflowVersion {
        id: parse_uuid(&id)?,
        workflow_id: parse_uuid(&workflow_id)?,
        version: row.try_get("version").map_err(db_err)?,
        graph: decode_json(&graph_json)?,
        metadata: decode_json(&metadata_json)?,
        created_by: row.try_get("created_by").map_err(db_err)?,
        created_at: decode_ts(&created_at)?,
        notes: row.try_get("notes").map_err(db_err)?,
    })
}

fn row_to_run(row: &SqliteRow) -> Result<WorkflowRun, OrcheoError> {
    let id: String = row.try_get("id").map_err(db_err)?;
    let workflow_id: String = row.try_get("workflow_id").map_err(db_err)?;
    let version_id: String = row.try_get("workflow_version_id").map_err(db_err)?;
    let status: String = row.try_get("status").map_err(db_err)?;
    let input_json: String = row.try_get("input_json").map_err(db_err)?;
    let output_json: Option<String> = row.try_get("output_json").map_err(db_err)?;
    let created_at: String = row.try_get("created_at").map_err(db_err)?;
    let audit_json: String = row.try_get("audit_json").map_err(db_err)?;
    Ok(WorkflowRun {
        id: parse_uuid(&id)?,
        workflow_id: parse_uuid(&workflow_id)?,
        workflow_version_id: parse_uuid(&version_id)?,
        status: WorkflowRunStatus::parse(&status)?,
        triggered_by: row.try_get("triggered_by").map_err(db_err)?,
        input_payload: decode_json(&input_json)?,
        output_payload: output_json.as_deref().map(decode_json).transpose()?,
        started_at: decode_opt_ts(row.try_get("started_at").map_err(db_err)?)?,
        completed_at: decode_opt_ts(row.try_get("completed_at").map_err(db_err)?)?,
        error: row.try_get("error").map_err(db_err)?,
        created_at: decode_ts(&created_at)?,
        audit_log: serde_json::from_str(&audit_json)?,
    })
}

const WORKFLOW_COLUMNS: &str = "id, name, slug, description, tags_json, is_archived, is_public,
    publish_token_hash, published_at, published_by, publish_token_rotated_at,
    require_login, created_at, updated_at, audit_dropped";

const RUN_COLUMNS: &str = "id, workflow_id, workflow_version_id, status, triggered_by,
    input_json, output_json, started_at, completed_at, error, created_at, audit_json";

#[async_trait]
impl WorkflowRepository for SqliteWorkflowRepository {
    async fn create_workflow(&self, mut workflow: Workflow) -> Result<Workflow, OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let base = workflow.slug.clone();
        let mut counter = 2;
        loop {
            let taken = sqlx::query("SELECT 1 FROM workflows WHERE slug = ?")
                .bind(&workflow.slug)
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_err)?;
            if taken.is_none() {
                break;
            }
            workflow.slug = format!("{base}-{counter}");
            counter += 1;
        }
        write_workflow_row(&mut tx, &workflow, true).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, OrcheoError> {
        self.backend.ensure_schema().await?;
        let query = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("workflow", id.to_string()))?;
        self.row_to_workflow(&row).await
    }

    async fn get_workflow_by_slug(&self, slug: &str) -> Result<Workflow, OrcheoError> {
        self.backend.ensure_schema().await?;
        let query = format!("SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE slug = ?");
        let row = sqlx::query(&query)
            .bind(slug)
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("workflow", slug))?;
        self.row_to_workflow(&row).await
    }

    async fn list_workflows(&self, include_archived: bool) -> Result<Vec<Workflow>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let query = if include_archived {
            format!("SELECT {WORKFLOW_COLUMNS} FROM workflows ORDER BY created_at")
        } else {
            format!(
                "SELECT {WORKFLOW_COLUMNS} FROM workflows WHERE is_archived = 0 ORDER BY created_at"
            )
        };
        let rows = sqlx::query(&query)
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err)?;
        let mut workflows = Vec::with_capacity(rows.len());
        for row in &rows {
            workflows.push(self.row_to_workflow(row).await?);
        }
        Ok(workflows)
    }

    async fn update_workflow(&self, workflow: Workflow) -> Result<Workflow, OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let exists = sqlx::query("SELECT 1 FROM workflows WHERE id = ?")
            .bind(workflow.id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(OrcheoError::not_found("workflow", workflow.id.to_string()));
        }
        write_workflow_row(&mut tx, &workflow, false).await?;
        tx.commit().await.map_err(db_err)?;
        Ok(workflow)
    }

    async fn create_version(
        &self,
        workflow_id: Uuid,
        graph: Value,
        metadata: Value,
        created_by: &str,
        notes: Option<String>,
    ) -> Result<WorkflowVersion, OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let mut tx = self.backend.pool().begin().await.map_err(db_err)?;
        let exists = sqlx::query("SELECT 1 FROM workflows WHERE id = ?")
            .bind(workflow_id.to_string())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(OrcheoError::not_found("workflow", workflow_id.to_string()));
        }
        let next: i64 = sqlx::query(
            "SELECT COALESCE(MAX(version), 0) + 1 AS next
               FROM workflow_versions WHERE workflow_id = ?",
        )
        .bind(workflow_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?
        .try_get("next")
        .map_err(db_err)?;
        let version = WorkflowVersion::new(workflow_id, next, graph, metadata, created_by, notes);
        sqlx::query(
            "INSERT INTO workflow_versions (
                id, workflow_id, version, graph_json, metadata_json, created_by, created_at, notes
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(version.id.to_string())
        .bind(version.workflow_id.to_string())
        .bind(version.version)
        .bind(encode_json(&version.graph)?)
        .bind(encode_json(&version.metadata)?)
        .bind(&version.created_by)
        .bind(encode_ts(&version.created_at))
        .bind(&version.notes)
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(version)
    }

    async fn get_version(&self, id: Uuid) -> Result<WorkflowVersion, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query("SELECT * FROM workflow_versions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("workflow version", id.to_string()))?;
        row_to_version(&row)
    }

    async fn get_version_by_number(
        &self,
        workflow_id: Uuid,
        version: i64,
    ) -> Result<WorkflowVersion, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT * FROM workflow_versions WHERE workflow_id = ? AND version = ?",
        )
        .bind(workflow_id.to_string())
        .bind(version)
        .fetch_optional(self.backend.pool())
        .await
        .map_err(db_err)?
        .ok_or_else(|| {
            OrcheoError::not_found("workflow version", format!("{workflow_id}@{version}"))
        })?;
        row_to_version(&row)
    }

    async fn latest_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let row = sqlx::query(
            "SELECT * FROM workflow_versions WHERE workflow_id = ?
              ORDER BY version DESC LIMIT 1",
        )
        .bind(workflow_id.to_string())
        .fetch_optional(self.backend.pool())
        .await
        .map_err(db_err)?;
        row.as_ref().map(row_to_version).transpose()
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersion>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let rows = sqlx::query(
            "SELECT * FROM workflow_versions WHERE workflow_id = ? ORDER BY version",
        )
        .bind(workflow_id.to_string())
        .fetch_all(self.backend.pool())
        .await
        .map_err(db_err)?;
        rows.iter().map(row_to_version).collect()
    }

    async fn create_run(&self, run: WorkflowRun) -> Result<WorkflowRun, OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let exists = sqlx::query("SELECT 1 FROM workflows WHERE id = ?")
            .bind(run.workflow_id.to_string())
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?;
        if exists.is_none() {
            return Err(OrcheoError::not_found(
                "workflow",
                run.workflow_id.to_string(),
            ));
        }
        sqlx::query(
            "INSERT INTO workflow_runs (
                id, workflow_id, workflow_version_id, status, triggered_by, input_json,
                output_json, started_at, completed_at, error, created_at, audit_json
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(run.id.to_string())
        .bind(run.workflow_id.to_string())
        .bind(run.workflow_version_id.to_string())
        .bind(run.status.as_str())
        .bind(&run.triggered_by)
        .bind(encode_json(&run.input_payload)?)
        .bind(run.output_payload.as_ref().map(encode_json).transpose()?)
        .bind(encode_opt_ts(&run.started_at))
        .bind(encode_opt_ts(&run.completed_at))
        .bind(&run.error)
        .bind(encode_ts(&run.created_at))
        .bind(serde_json::to_string(&run.audit_log)?)
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<WorkflowRun, OrcheoError> {
        self.backend.ensure_schema().await?;
        let query = format!("SELECT {RUN_COLUMNS} FROM workflow_runs WHERE id = ?");
        let row = sqlx::query(&query)
            .bind(id.to_string())
            .fetch_optional(self.backend.pool())
            .await
            .map_err(db_err)?
            .ok_or_else(|| OrcheoError::not_found("workflow run", id.to_string()))?;
        row_to_run(&row)
    }

    async fn list_runs(&self, workflow_id: Uuid) -> Result<Vec<WorkflowRun>, OrcheoError> {
        self.backend.ensure_schema().await?;
        let query = format!(
            "SELECT {RUN_COLUMNS} FROM workflow_runs WHERE workflow_id = ? ORDER BY created_at"
        );
        let rows = sqlx::query(&query)
            .bind(workflow_id.to_string())
            .fetch_all(self.backend.pool())
            .await
            .map_err(db_err)?;
        rows.iter().map(row_to_run).collect()
    }

    async fn update_run(&self, run: WorkflowRun) -> Result<WorkflowRun, OrcheoError> {
        self.backend.ensure_schema().await?;
        let _writer = self.backend.writer().lock().await;
        let result = sqlx::query(
            "UPDATE workflow_runs SET
                status = ?, output_json = ?, started_at = ?, completed_at = ?,
                error = ?, audit_json = ?
              WHERE id = ?",
        )
        .bind(run.status.as_str())
        .bind(run.output_payload.as_ref().map(encode_json).transpose()?)
        .bind(encode_opt_ts(&run.started_at))
        .bind(encode_opt_ts(&run.completed_at))
        .bind(&run.error)
        .bind(serde_json::to_string(&run.audit_log)?)
        .bind(run.id.to_string())
        .execute(self.backend.pool())
        .await
        .map_err(db_err)?;
        if result.rows_affected() == 0 {
            return Err(OrcheoError::not_found("workflow run", run.id.to_string()));
        }
        Ok(run)
    }
}
