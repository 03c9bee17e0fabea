use orcheo_backend::memory::InMemoryWorkflowRepository;
use orcheo_backend::WorkflowRepository;
use orcheo_types::{
    hash_publish_token, mask_publish_token, OrcheoError, Workflow, WorkflowRun,
    WorkflowRunStatus,
};
use serde_json::json;

async fn seeded() -> (InMemoryWorkflowRepository, Workflow) {
    let repository = InMemoryWorkflowRepository::new();
    let workflow = repository
        .create_workflow(Workflow::new("Demo", None, vec![], "alice").expect("workflow"))
        .await
        .expect("create");
    (repository, workflow)
}

#[tokio::test]
async fn publish_rotate_revoke_lifecycle() {
    let (repository, workflow) = seeded().await;
    let first_hash = hash_publish_token("token-one");
    let second_hash = hash_publish_token("token-two");

    let published = repository
        .publish_workflow(workflow.id, &first_hash, false, "alice")
        .await
        .expect("publish");
    assert!(published.is_public);
    assert_eq!(published.publish_token_hash.as_deref(), Some(first_hash.as_str()));

    // publishing twice is a state conflict
    assert!(matches!(
        repository
            .publish_workflow(workflow.id, &first_hash, false, "alice")
            .await,
        Err(OrcheoError::PublishState(_))
    ));

    let rotated = repository
        .rotate_publish_token(workflow.id, &second_hash, "alice")
        .await
        .expect("rotate");
    let rotation_event = rotated.audit_log.last().expect("event");
    assert_eq!(rotation_event.action, "workflow_publish_token_rotated");
    assert_eq!(
        rotation_event.metadata["previous_token"],
        json!(mask_publish_token(&first_hash))
    );
    assert_eq!(
        rotation_event.metadata["new_token"],
        json!(mask_publish_token(&second_hash))
    );

    let revoked = repository
        .revoke_publish(workflow.id, "alice")
        .await
        .expect("revoke");
    assert!(!revoked.is_public);
    assert!(revoked.publish_token_hash.is_none());
    assert!(matches!(
        repository.revoke_publish(workflow.id, "alice").await,
        Err(OrcheoError::PublishState(_))
    ));
}

#[tokio::test]
async fn rotate_requires_published_workflow() {
    let (repository, workflow) = seeded().await;
    assert!(matches!(
        repository
            .rotate_publish_token(workflow.id, &hash_publish_token("x"), "alice")
            .await,
        Err(OrcheoError::PublishState(_))
    ));
}

#[tokio::test]
async fn version_sequence_is_strictly_increasing_from_one() {
    let (repository, workflow) = seeded().await;
    let mut seen = Vec::new();
    for revision in 0..5 {
        let version = repository
            .create_version(workflow.id, json!({"rev": revision}), json!({}), "alice", None)
            .await
            .expect("version");
        seen.push(version.version);
    }
    assert_eq!(seen, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn version_diff_produces_ordered_change_lines() {
    let (repository, workflow) = seeded().await;
    repository
        .create_version(
            workflow.id,
            json!({"entry": "a", "nodes": [{"id": "a", "type": "Noop"}]}),
            json!({}),
            "alice",
            None,
        )
        .await
        .expect("base");
    repository
        .create_version(
            workflow.id,
            json!({"entry": "a", "nodes": [{"id": "a", "type": "Reply"}]}),
            json!({}),
            "alice",
            None,
        )
        .await
        .expect("target");

    let diff = repository
        .diff_versions(workflow.id, 1, 2)
        .await
        .expect("diff");
    assert_eq!(diff.base.version, 1);
    assert_eq!(diff.target.version, 2);
    assert!(diff.lines.iter().any(|line| line.starts_with('-') && line.contains("Noop")));
    assert!(diff.lines.iter().any(|line| line.starts_with('+') && line.contains("Reply")));
}

#[tokio::test]
async fn run_transition_helpers_respect_the_state_machine() {
    let (repository, workflow) = seeded().await;
    let version = repository
        .create_version(workflow.id, json!({}), json!({}), "alice", None)
        .await
        .expect("version");
    let run = repository
        .create_run(WorkflowRun::new(
            workflow.id,
            version.id,
            "alice",
            json!({"x": 1}),
        ))
        .await
        .expect("run");

    repository
        .mark_run_started(run.id, "engine")
        .await
        .expect("start");
    repository
        .mark_run_cancelled(run.id, "engine", Some("user-cancel"))
        .await
        .expect("cancel");
    let loaded = repository.get_run(run.id).await.expect("get");
    assert_eq!(loaded.status, WorkflowRunStatus::Cancelled);
    assert_eq!(loaded.error.as_deref(), Some("user-cancel"));

    // terminal state is never silently overwritten
    assert!(matches!(
        repository.mark_run_failed(run.id, "engine", "late").await,
        Err(OrcheoError::InvalidTransition(_))
    ));

    let runs = repository.list_runs(workflow.id).await.expect("list");
    assert_eq!(runs.len(), 1);
}

#[tokio::test]
async fn archived_workflows_are_hidden_from_default_listing() {
    let (repository, workflow) = seeded().await;
    let mut archived = repository.get_workflow(workflow.id).await.expect("get");
    archived.archive("alice");
    repository.update_workflow(archived).await.expect("update");

    assert!(repository.list_workflows(false).await.expect("list").is_empty());
    assert_eq!(repository.list_workflows(true).await.expect("list").len(), 1);
}
