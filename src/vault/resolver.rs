//! `[[credential_name]]` reference substitution applied to node config
//! strings before node construction. The resolver is the only path from
//! graph config to plaintext; node code never sees the vault itself.

use crate::vault::CredentialVault;
use orcheo_types::{CredentialAccessContext, OrcheoError};
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use std::sync::OnceLock;
use uuid::Uuid;

fn reference_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\[\[\s*([A-Za-z0-9][A-Za-z0-9 _.\-]*?)\s*\]\]")
            .expect("credential reference pattern is valid")
    })
}

/// Resolver bound to one execution's workflow scope.
#[derive(Clone)]
pub struct CredentialResolver {
    vault: Arc<CredentialVault>,
    context: CredentialAccessContext,
}

impl CredentialResolver {
    pub fn new(vault: Arc<CredentialVault>, workflow_id: Option<Uuid>) -> Self {
        CredentialResolver {
            vault,
            context: CredentialAccessContext { workflow_id },
        }
    }

    pub fn context(&self) -> &CredentialAccessContext {
        &self.context
    }

    /// Substitute every `[[name]]` token in the text. Missing credentials
    /// fail resolution, which in turn fails node construction.
    pub async fn resolve_text(&self, text: &str) -> Result<String, OrcheoError> {
        if !text.contains("[[") {
            return Ok(text.to_string());
        }
        let pattern = reference_pattern();
        let mut resolved = String::with_capacity(text.len());
        let mut cursor = 0usize;
        for captures in pattern.captures_iter(text) {
            let matched = captures.get(0).map(|m| (m.start(), m.end()));
            let name = captures.get(1).map(|m| m.as_str());
            let (Some((start, end)), Some(name)) = (matched, name) else {
                continue;
            };
            resolved.push_str(&text[cursor..start]);
            let plaintext = self.vault.resolve_plaintext(name, &self.context).await?;
            resolved.push_str(&plaintext);
            cursor = end;
        }
        resolved.push_str(&text[cursor..]);
        Ok(resolved)
    }

    /// Walk a config value and substitute references in every string
    /// field after deserialization, before node construction.
    pub async fn resolve_value(&self, value: &Value) -> Result<Value, OrcheoError> {
        match value {
            Value::String(text) => Ok(Value::String(self.resolve_text(text).await?)),
            Value::Array(items) => {
                let mut resolved = Vec::with_capacity(items.len());
                for item in items {
                    resolved.push(Box::pin(self.resolve_value(item)).await?);
                }
                Ok(Value::Array(resolved))
            }
            Value::Object(map) => {
                let mut resolved = serde_json::Map::with_capacity(map.len());
                for (key, child) in map {
                    resolved.insert(key.clone(), Box::pin(self.resolve_value(child)).await?);
                }
                Ok(Value::Object(resolved))
            }
            other => Ok(other.clone()),
        }
    }
}
