//! Webhook trigger configuration persisted per workflow.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Supported HMAC digest algorithms for webhook signatures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmacAlgorithm {
    #[default]
    Sha256,
    Sha512,
}

impl HmacAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HmacAlgorithm::Sha256 => "sha256",
            HmacAlgorithm::Sha512 => "sha512",
        }
    }
}

/// Sliding-window rate limit applied to inbound trigger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookRateLimit {
    pub limit: u32,
    pub interval_seconds: u64,
}

fn default_methods() -> Vec<String> {
    vec!["POST".to_string()]
}

fn default_tolerance() -> u64 {
    300
}

/// Admission rules for a workflow's webhook trigger. Persisted as a JSON
/// document alongside the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookTriggerConfig {
    #[serde(default = "default_methods")]
    pub allowed_methods: Vec<String>,
    pub shared_secret_header: Option<String>,
    pub shared_secret: Option<String>,
    pub hmac_header: Option<String>,
    pub hmac_secret: Option<String>,
    #[serde(default)]
    pub hmac_algorithm: HmacAlgorithm,
    pub hmac_timestamp_header: Option<String>,
    #[serde(default = "default_tolerance")]
    pub tolerance_seconds: u64,
    #[serde(default)]
    pub required_headers: BTreeMap<String, String>,
    #[serde(default)]
    pub required_query_params: BTreeMap<String, String>,
    pub rate_limit: Option<WebhookRateLimit>,
}

impl Default for WebhookTriggerConfig {
    fn default() -> Self {
        WebhookTriggerConfig {
            allowed_methods: default_methods(),
            shared_secret_header: None,
            shared_secret: None,
            hmac_header: None,
            hmac_secret: None,
            hmac_algorithm: HmacAlgorithm::default(),
            hmac_timestamp_header: None,
            tolerance_seconds: default_tolerance(),
            required_headers: BTreeMap::new(),
            required_query_params: BTreeMap::new(),
            rate_limit: None,
        }
    }
}
