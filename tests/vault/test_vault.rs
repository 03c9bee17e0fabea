use orcheo::vault::{CreateCredentialParams, CredentialResolver, CredentialVault, SecretCipher};
use orcheo_backend::memory::InMemoryCredentialStore;
use orcheo_types::{
    CredentialAccess, CredentialAccessContext, CredentialKind, OrcheoError,
};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

fn vault() -> Arc<CredentialVault> {
    let store = Arc::new(InMemoryCredentialStore::new());
    let cipher = Arc::new(SecretCipher::new("unit-test-vault-key").expect("cipher"));
    Arc::new(CredentialVault::new(store, cipher))
}

fn params(name: &str, workflow_id: Option<Uuid>, access: CredentialAccess) -> CreateCredentialParams {
    CreateCredentialParams {
        name: name.to_string(),
        provider: "openai".to_string(),
        kind: CredentialKind::Secret,
        secret: format!("secret-for-{name}"),
        actor: "alice".to_string(),
        workflow_id,
        access,
        template_id: None,
        scopes: vec![],
    }
}

#[tokio::test]
async fn private_credentials_enforce_workflow_scope() {
    let vault = vault();
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let credential = vault
        .create_credential(params("k", Some(owner), CredentialAccess::Private))
        .await
        .expect("create");

    let revealed = vault
        .reveal_secret(credential.id, &CredentialAccessContext::for_workflow(owner))
        .await
        .expect("reveal in scope");
    assert_eq!(revealed, "secret-for-k");

    let err = vault
        .reveal_secret(credential.id, &CredentialAccessContext::for_workflow(stranger))
        .await
        .expect_err("scope violation");
    assert!(matches!(err, OrcheoError::WorkflowScope(_)));

    // listings from the other workflow do not include the credential
    let listed = vault
        .list_credentials(&CredentialAccessContext::for_workflow(stranger))
        .await
        .expect("list");
    assert!(listed.iter().all(|entry| entry.name != "k"));
}

#[tokio::test]
async fn listings_only_expose_previews() {
    let vault = vault();
    let credential = vault
        .create_credential(params("preview", None, CredentialAccess::Public))
        .await
        .expect("create");
    let listed = vault
        .list_credentials(&CredentialAccessContext::default())
        .await
        .expect("list");
    let entry = listed
        .iter()
        .find(|entry| entry.id == credential.id)
        .expect("listed");
    let preview = entry.secret.preview();
    assert!(preview.starts_with("en"));
    assert!(!entry.secret.ciphertext.contains("secret-for-preview"));
    assert!(!preview.contains("secret"));
}

#[tokio::test]
async fn duplicate_names_conflict_within_scope_only() {
    let vault = vault();
    let workflow = Uuid::new_v4();
    vault
        .create_credential(params("token", Some(workflow), CredentialAccess::Private))
        .await
        .expect("create");
    let err = vault
        .create_credential(params("token", Some(workflow), CredentialAccess::Private))
        .await
        .expect_err("conflict");
    assert!(matches!(err, OrcheoError::NameConflict(_)));
    vault
        .create_credential(params("token", Some(Uuid::new_v4()), CredentialAccess::Private))
        .await
        .expect("different scope");
}

#[tokio::test]
async fn mutations_append_audit_events() {
    let vault = vault();
    let workflow = Uuid::new_v4();
    let context = CredentialAccessContext::for_workflow(workflow);
    let credential = vault
        .create_credential(params("audited", Some(workflow), CredentialAccess::Private))
        .await
        .expect("create");
    let updated = vault
        .update_secret(credential.id, "rotated-secret", "bob", &context)
        .await
        .expect("update");
    let actions: Vec<&str> = updated
        .audit_log
        .events
        .iter()
        .map(|event| event.action.as_str())
        .collect();
    assert_eq!(actions, vec!["credential_created", "credential_secret_updated"]);
    let revealed = vault
        .reveal_secret(credential.id, &context)
        .await
        .expect("reveal");
    assert_eq!(revealed, "rotated-secret");
}

#[tokio::test]
async fn resolver_substitutes_references_in_config_strings() {
    let vault = vault();
    let workflow = Uuid::new_v4();
    vault
        .create_credential(params("api key", Some(workflow), CredentialAccess::Private))
        .await
        .expect("create");

    let resolver = CredentialResolver::new(vault.clone(), Some(workflow));
    let config = json!({
        "token": "Bearer [[api key]]",
        "nested": {"values": ["[[api key]]", "plain"]},
        "count": 3
    });
    let resolved = resolver.resolve_value(&config).await.expect("resolve");
    assert_eq!(resolved["token"], json!("Bearer secret-for-api key"));
    assert_eq!(resolved["nested"]["values"][0], json!("secret-for-api key"));
    assert_eq!(resolved["nested"]["values"][1], json!("plain"));
    assert_eq!(resolved["count"], json!(3));
}

#[tokio::test]
async fn resolver_fails_on_missing_credentials() {
    let vault = vault();
    let resolver = CredentialResolver::new(vault, Some(Uuid::new_v4()));
    let err = resolver
        .resolve_text("prefix [[missing]] suffix")
        .await
        .expect_err("missing credential");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn resolver_prefers_workflow_scoped_match() {
    let vault = vault();
    let workflow = Uuid::new_v4();
    let mut shared = params("dual", None, CredentialAccess::Shared);
    shared.secret = "shared-secret".to_string();
    vault.create_credential(shared).await.expect("shared");
    let mut scoped = params("dual", Some(workflow), CredentialAccess::Private);
    scoped.secret = "scoped-secret".to_string();
    vault.create_credential(scoped).await.expect("scoped");

    let resolver = CredentialResolver::new(vault.clone(), Some(workflow));
    assert_eq!(
        resolver.resolve_text("[[dual]]").await.expect("resolve"),
        "scoped-secret"
    );
    let global = CredentialResolver::new(vault, None);
    assert_eq!(
        global.resolve_text("[[dual]]").await.expect("resolve"),
        "shared-secret"
    );
}

#[tokio::test]
async fn deleted_credentials_stop_resolving() {
    let vault = vault();
    let workflow = Uuid::new_v4();
    let context = CredentialAccessContext::for_workflow(workflow);
    let credential = vault
        .create_credential(params("ephemeral", Some(workflow), CredentialAccess::Private))
        .await
        .expect("create");
    vault
        .delete_credential(credential.id, "alice", &context)
        .await
        .expect("delete");
    assert!(vault
        .reveal_secret(credential.id, &context)
        .await
        .expect_err("gone")
        .is_not_found());
}
