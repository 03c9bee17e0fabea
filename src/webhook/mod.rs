//! Webhook trigger admission: method allow-list, shared-secret and HMAC
//! authentication with replay protection, required header/query checks,
//! and a sliding-window rate limit. All comparisons against secret
//! material are constant-time.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use orcheo_types::{
    canonical_json, HmacAlgorithm, OrcheoError, WebhookTriggerConfig,
};
use serde_json::Value;
use sha2::{Sha256, Sha512};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Bound on remembered signatures for replay detection.
const SEEN_SIGNATURE_CAP: usize = 1024;

/// Inbound trigger payload. HMAC signs the canonical-JSON encoding of
/// mappings and the raw bytes of anything else.
#[derive(Debug, Clone)]
pub enum WebhookPayload {
    Json(Value),
    Text(String),
    Bytes(Vec<u8>),
}

impl WebhookPayload {
    fn signing_bytes(&self) -> Vec<u8> {
        match self {
            WebhookPayload::Json(value) => canonical_json(value).into_bytes(),
            WebhookPayload::Text(text) => text.as_bytes().to_vec(),
            WebhookPayload::Bytes(bytes) => bytes.clone(),
        }
    }
}

/// Parsed inbound request, already free of transport framing.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub query_params: BTreeMap<String, String>,
    pub payload: WebhookPayload,
}

impl WebhookRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

#[derive(Default)]
struct TriggerState {
    recent_invocations: VecDeque<DateTime<Utc>>,
    seen_signatures: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl TriggerState {
    fn remember_signature(&mut self, signature: &str) {
        if self.seen_signatures.insert(signature.to_string()) {
            self.seen_order.push_back(signature.to_string());
            while self.seen_order.len() > SEEN_SIGNATURE_CAP {
                if let Some(evicted) = self.seen_order.pop_front() {
                    self.seen_signatures.remove(&evicted);
                }
            }
        }
    }
}

/// Admission service holding per-workflow trigger state.
#[derive(Default)]
pub struct WebhookAdmission {
    states: DashMap<Uuid, Arc<Mutex<TriggerState>>>,
}

impl WebhookAdmission {
    pub fn new() -> Self {
        Self::default()
    }

    fn state_for(&self, workflow_id: Uuid) -> Arc<Mutex<TriggerState>> {
        self.states
            .entry(workflow_id)
            .or_insert_with(|| Arc::new(Mutex::new(TriggerState::default())))
            .clone()
    }

    /// Validate a request against the workflow's trigger config. On
    /// success, returns the header map scrubbed of the shared-secret
    /// header, ready for use as trigger input metadata.
    pub async fn admit(
        &self,
        workflow_id: Uuid,
        config: &WebhookTriggerConfig,
        request: &WebhookRequest,
    ) -> Result<BTreeMap<String, String>, OrcheoError> {
        self.admit_at(workflow_id, config, request, Utc::now()).await
    }

    /// Same as `admit`, with an explicit clock. Exercised directly by
    /// tests that need deterministic window arithmetic.
    pub async fn admit_at(
        &self,
        workflow_id: Uuid,
        config: &WebhookTriggerConfig,
        request: &WebhookRequest,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>, OrcheoError> {
        let method = request.method.to_uppercase();
        if !config
            .allowed_methods
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&method))
        {
            return Err(OrcheoError::WebhookValidation(format!(
                "method {method} is not allowed"
            )));
        }

        if let (Some(header), Some(secret)) = (&config.shared_secret_header, &config.shared_secret)
        {
            let presented = request.header(header).ok_or_else(|| {
                OrcheoError::WebhookAuthentication(format!(
                    "missing shared secret header '{header}'"
                ))
            })?;
            let matches: bool = presented.as_bytes().ct_eq(secret.as_bytes()).into();
            if !matches {
                return Err(OrcheoError::WebhookAuthentication(
                    "shared secret mismatch".to_string(),
                ));
            }
        }

        for (name, expected) in &config.required_headers {
            let presented = request.header(name).ok_or_else(|| {
                OrcheoError::WebhookValidation(format!("missing required header '{name}'"))
            })?;
            if presented != expected {
                return Err(OrcheoError::WebhookValidation(format!(
                    "header '{name}' does not match the required value"
                )));
            }
        }

        for (name, expected) in &config.required_query_params {
            let presented = request.query_params.get(name).ok_or_else(|| {
                OrcheoError::WebhookValidation(format!("missing required query param '{name}'"))
            })?;
            if presented != expected {
                return Err(OrcheoError::WebhookValidation(format!(
                    "query param '{name}' does not match the required value"
                )));
            }
        }

        let state = self.state_for(workflow_id);
        let mut state = state.lock().await;

        if let (Some(header), Some(secret)) = (&config.hmac_header, &config.hmac_secret) {
            let presented = request.header(header).ok_or_else(|| {
                OrcheoError::WebhookAuthentication(format!("missing signature header '{header}'"))
            })?;
            let timestamp = match &config.hmac_timestamp_header {
                Some(timestamp_header) => {
                    let raw = request.header(timestamp_header).ok_or_else(|| {
                        OrcheoError::WebhookAuthentication(format!(
                            "missing timestamp header '{timestamp_header}'"
                        ))
                    })?;
                    let parsed: i64 = raw.trim().parse().map_err(|_| {
                        OrcheoError::WebhookAuthentication(format!(
                            "timestamp header '{timestamp_header}' is not a unix timestamp"
                        ))
                    })?;
                    let skew = (now.timestamp() - parsed).unsigned_abs();
                    if skew > config.tolerance_seconds {
                        return Err(OrcheoError::WebhookAuthentication(format!(
                            "timestamp outside the {}s tolerance window",
                            config.tolerance_seconds
                        )));
                    }
                    Some(raw.trim().to_string())
                }
                None => None,
            };
            let expected = compute_signature(
                config.hmac_algorithm,
                secret,
                timestamp.as_deref(),
                &request.payload,
            )?;
            let matches: bool = presented
                .trim()
                .as_bytes()
                .ct_eq(expected.as_bytes())
                .into();
            if !matches {
                return Err(OrcheoError::WebhookAuthentication(
                    "signature mismatch".to_string(),
                ));
            }
            if state.seen_signatures.contains(presented.trim()) {
                return Err(OrcheoError::WebhookAuthentication(
                    "signature replay detected".to_string(),
                ));
            }
            state.remember_signature(presented.trim());
        }

        if let Some(rate_limit) = &config.rate_limit {
            let window_start = now - Duration::seconds(rate_limit.interval_seconds as i64);
            while state
                .recent_invocations
                .front()
                .map(|at| *at <= window_start)
                .unwrap_or(false)
            {
                state.recent_invocations.pop_front();
            }
            if state.recent_invocations.len() >= rate_limit.limit as usize {
                return Err(OrcheoError::RateLimitExceeded(format!(
                    "workflow {workflow_id} exceeded {} requests per {}s",
                    rate_limit.limit, rate_limit.interval_seconds
                )));
            }
            state.recent_invocations.push_back(now);
        }

        let mut scrubbed = request.headers.clone();
        if let Some(secret_header) = &config.shared_secret_header {
            scrubbed.retain(|name, _| !name.eq_ignore_ascii_case(secret_header));
        }
        Ok(scrubbed)
    }
}

/// Compute the hex HMAC over `timestamp.payload` (or the bare payload
/// when no timestamp header is configured).
pub fn compute_signature(
    algorithm: HmacAlgorithm,
    secret: &str,
    timestamp: Option<&str>,
    payload: &WebhookPayload,
) -> Result<String, OrcheoError> {
    let mut message = Vec::new();
    if let Some(timestamp) = timestamp {
        message.extend_from_slice(timestamp.as_bytes());
        message.push(b'.');
    }
    message.extend_from_slice(&payload.signing_bytes());

    match algorithm {
        HmacAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).map_err(|_| {
                OrcheoError::Config("HMAC secret has invalid length".to_string())
            })?;
            mac.update(&message);
            Ok(hex::encode(mac.finalize().into_bytes()))
        }
        HmacAlgorithm::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).map_err(|_| {
                OrcheoError::Config("HMAC secret has invalid length".to_string())
            })?;
            mac.update(&message);
            Ok(hex::encode(mac.finalize().into_bytes()))
        }
    }
}
