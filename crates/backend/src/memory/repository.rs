use crate::store::WorkflowRepository;
use async_trait::async_trait;
use orcheo_types::{OrcheoError, Workflow, WorkflowRun, WorkflowVersion};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct RepositoryState {
    workflows: HashMap<Uuid, Workflow>,
    versions: HashMap<Uuid, WorkflowVersion>,
    versions_by_workflow: HashMap<Uuid, Vec<Uuid>>,
    runs: HashMap<Uuid, WorkflowRun>,
    runs_by_workflow: HashMap<Uuid, Vec<Uuid>>,
}

impl RepositoryState {
    fn slug_taken(&self, slug: &str, exclude: Uuid) -> bool {
        self.workflows
            .values()
            .any(|workflow| workflow.slug == slug && workflow.id != exclude)
    }
}

/// Workflow repository backed by process-local maps.
#[derive(Default)]
pub struct InMemoryWorkflowRepository {
    state: Mutex<RepositoryState>,
}

impl InMemoryWorkflowRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl WorkflowRepository for InMemoryWorkflowRepository {
    async fn create_workflow(&self, mut workflow: Workflow) -> Result<Workflow, OrcheoError> {
        let mut state = self.state.lock().await;
        if state.workflows.contains_key(&workflow.id) {
            return Err(OrcheoError::Validation(format!(
                "workflow {} already exists",
                workflow.id
            )));
        }
        // Keep slugs unique by suffixing duplicates.
        if state.slug_taken(&workflow.slug, workflow.id) {
            let base = workflow.slug.clone();
            let mut counter = 2;
            while state.slug_taken(&format!("{base}-{counter}"), workflow.id) {
                counter += 1;
            }
            workflow.slug = format!("{base}-{counter}");
        }
        state.workflows.insert(workflow.id, workflow.clone());
        Ok(workflow)
    }

    async fn get_workflow(&self, id: Uuid) -> Result<Workflow, OrcheoError> {
        let state = self.state.lock().await;
        state
            .workflows
            .get(&id)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("workflow", id.to_string()))
    }

    async fn get_workflow_by_slug(&self, slug: &str) -> Result<Workflow, OrcheoError> {
        let state = self.state.lock().await;
        state
            .workflows
            .values()
            .find(|workflow| workflow.slug == slug)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("workflow", slug))
    }

    async fn list_workflows(&self, include_archived: bool) -> Result<Vec<Workflow>, OrcheoError> {
        let state = self.state.lock().await;
        let mut workflows: Vec<Workflow> = state
            .workflows
            .values()
            .filter(|workflow| include_archived || !workflow.is_archived)
            .cloned()
            .collect();
        workflows.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(workflows)
    }

    async fn update_workflow(&self, workflow: Workflow) -> Result<Workflow, OrcheoError> {
        let mut state = self.state.lock().await;
        if !state.workflows.contains_key(&workflow.id) {
            return Err(OrcheoError::not_found("workflow", workflow.id.to_string()));
        }
        state.workflows.insert(workflow.id, workflow.clone());
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
        let mut state = self.state.lock().await;
        if !state.workflows.contains_key(&workflow_id) {
            return Err(OrcheoError::not_found("workflow", workflow_id.to_string()));
        }
        let next = state
            .versions_by_workflow
            .get(&workflow_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.versions.get(id))
            .map(|version| version.version + 1)
            .unwrap_or(1);
        let version = WorkflowVersion::new(workflow_id, next, graph, metadata, created_by, notes);
        state.versions.insert(version.id, version.clone());
        state
            .versions_by_workflow
            .entry(workflow_id)
            .or_default()
            .push(version.id);
        Ok(version)
    }

    async fn get_version(&self, id: Uuid) -> Result<WorkflowVersion, OrcheoError> {
        let state = self.state.lock().await;
        state
            .versions
            .get(&id)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("workflow version", id.to_string()))
    }

    async fn get_version_by_number(
        &self,
        workflow_id: Uuid,
        version: i64,
    ) -> Result<WorkflowVersion, OrcheoError> {
        let state = self.state.lock().await;
        state
            .versions_by_workflow
            .get(&workflow_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.versions.get(id))
            .find(|candidate| candidate.version == version)
            .cloned()
            .ok_or_else(|| {
                OrcheoError::not_found("workflow version", format!("{workflow_id}@{version}"))
            })
    }

    async fn latest_version(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowVersion>, OrcheoError> {
        let state = self.state.lock().await;
        Ok(state
            .versions_by_workflow
            .get(&workflow_id)
            .and_then(|ids| ids.last())
            .and_then(|id| state.versions.get(id))
            .cloned())
    }

    async fn list_versions(&self, workflow_id: Uuid) -> Result<Vec<WorkflowVersion>, OrcheoError> {
        let state = self.state.lock().await;
        Ok(state
            .versions_by_workflow
            .get(&workflow_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.versions.get(id))
            .cloned()
            .collect())
    }

    async fn create_run(&self, run: WorkflowRun) -> Result<WorkflowRun, OrcheoError> {
        let mut state = self.state.lock().await;
        if !state.workflows.contains_key(&run.workflow_id) {
            return Err(OrcheoError::not_found(
                "workflow",
                run.workflow_id.to_string(),
            ));
        }
        state
            .runs_by_workflow
            .entry(run.workflow_id)
            .or_default()
            .push(run.id);
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> Result<WorkflowRun, OrcheoError> {
        let state = self.state.lock().await;
        state
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| OrcheoError::not_found("workflow run", id.to_string()))
    }

    async fn list_runs(&self, workflow_id: Uuid) -> Result<Vec<WorkflowRun>, OrcheoError> {
        let state = self.state.lock().await;
        Ok(state
            .runs_by_workflow
            .get(&workflow_id)
            .into_iter()
            .flatten()
            .filter_map(|id| state.runs.get(id))
            .cloned()
            .collect())
    }

    async fn update_run(&self, run: WorkflowRun) -> Result<WorkflowRun, OrcheoError> {
        let mut state = self.state.lock().await;
        if !state.runs.contains_key(&run.id) {
            return Err(OrcheoError::not_found("workflow run", run.id.to_string()));
        }
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }
}
