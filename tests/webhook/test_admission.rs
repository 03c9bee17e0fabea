use chrono::{Duration, Utc};
use orcheo::webhook::{compute_signature, WebhookAdmission, WebhookPayload, WebhookRequest};
use orcheo_types::{
    HmacAlgorithm, OrcheoError, WebhookRateLimit, WebhookTriggerConfig,
};
use serde_json::json;
use std::collections::BTreeMap;
use uuid::Uuid;

fn request_with_headers(headers: &[(&str, &str)]) -> WebhookRequest {
    WebhookRequest {
        method: "POST".to_string(),
        headers: headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect(),
        query_params: BTreeMap::new(),
        payload: WebhookPayload::Json(json!({"foo": "bar"})),
    }
}

fn hmac_config() -> WebhookTriggerConfig {
    WebhookTriggerConfig {
        hmac_header: Some("x-sig".to_string()),
        hmac_secret: Some("s".to_string()),
        hmac_algorithm: HmacAlgorithm::Sha256,
        hmac_timestamp_header: Some("x-sig-ts".to_string()),
        tolerance_seconds: 600,
        ..WebhookTriggerConfig::default()
    }
}

fn signed_request(config: &WebhookTriggerConfig, timestamp: i64) -> WebhookRequest {
    let payload = WebhookPayload::Json(json!({"foo": "bar"}));
    let signature = compute_signature(
        config.hmac_algorithm,
        config.hmac_secret.as_deref().unwrap_or_default(),
        Some(&timestamp.to_string()),
        &payload,
    )
    .expect("signature");
    request_with_headers(&[
        ("x-sig", signature.as_str()),
        ("x-sig-ts", &timestamp.to_string()),
    ])
}

#[tokio::test]
async fn disallowed_methods_are_rejected() {
    let admission = WebhookAdmission::new();
    let config = WebhookTriggerConfig::default();
    let mut request = request_with_headers(&[]);
    request.method = "DELETE".to_string();
    let err = admission
        .admit(Uuid::new_v4(), &config, &request)
        .await
        .expect_err("method rejected");
    assert!(matches!(err, OrcheoError::WebhookValidation(_)));
}

#[tokio::test]
async fn shared_secret_is_checked_and_scrubbed() {
    let admission = WebhookAdmission::new();
    let config = WebhookTriggerConfig {
        shared_secret_header: Some("x-orcheo-secret".to_string()),
        shared_secret: Some("hunter2".to_string()),
        ..WebhookTriggerConfig::default()
    };
    let workflow = Uuid::new_v4();

    let err = admission
        .admit(workflow, &config, &request_with_headers(&[("x-orcheo-secret", "wrong")]))
        .await
        .expect_err("wrong secret");
    assert!(matches!(err, OrcheoError::WebhookAuthentication(_)));

    // correct secret, case-insensitive header lookup; the secret header
    // is removed from the returned trigger metadata
    let headers = admission
        .admit(
            workflow,
            &config,
            &request_with_headers(&[("X-Orcheo-Secret", "hunter2"), ("x-request-id", "r1")]),
        )
        .await
        .expect("admitted");
    assert!(headers.keys().all(|name| !name.eq_ignore_ascii_case("x-orcheo-secret")));
    assert_eq!(headers.get("x-request-id").map(String::as_str), Some("r1"));
}

#[tokio::test]
async fn required_headers_and_query_params_must_match() {
    let admission = WebhookAdmission::new();
    let mut config = WebhookTriggerConfig::default();
    config
        .required_headers
        .insert("x-env".to_string(), "prod".to_string());
    config
        .required_query_params
        .insert("tenant".to_string(), "acme".to_string());
    let workflow = Uuid::new_v4();

    let err = admission
        .admit(workflow, &config, &request_with_headers(&[("x-env", "staging")]))
        .await
        .expect_err("header mismatch");
    assert!(matches!(err, OrcheoError::WebhookValidation(_)));

    let mut request = request_with_headers(&[("x-env", "prod")]);
    let err = admission
        .admit(workflow, &config, &request)
        .await
        .expect_err("missing query param");
    assert!(matches!(err, OrcheoError::WebhookValidation(_)));

    request
        .query_params
        .insert("tenant".to_string(), "acme".to_string());
    admission
        .admit(workflow, &config, &request)
        .await
        .expect("admitted");
}

#[tokio::test]
async fn hmac_accepts_once_then_rejects_replay_and_stale_timestamps() {
    let admission = WebhookAdmission::new();
    let config = hmac_config();
    let workflow = Uuid::new_v4();
    let now = Utc::now();

    // valid signature over timestamp.payload is accepted once
    let request = signed_request(&config, now.timestamp());
    admission
        .admit_at(workflow, &config, &request, now)
        .await
        .expect("first submission accepted");

    // the identical request is a replay
    let err = admission
        .admit_at(workflow, &config, &request, now)
        .await
        .expect_err("replay rejected");
    assert!(matches!(err, OrcheoError::WebhookAuthentication(_)));

    // a recomputed signature outside the tolerance window is rejected
    let stale = signed_request(&config, (now - Duration::seconds(1000)).timestamp());
    let err = admission
        .admit_at(workflow, &config, &stale, now)
        .await
        .expect_err("stale timestamp rejected");
    assert!(matches!(err, OrcheoError::WebhookAuthentication(_)));

    // and a bad signature never passes
    let mut forged = signed_request(&config, now.timestamp());
    forged
        .headers
        .insert("x-sig".to_string(), "0".repeat(64));
    let err = admission
        .admit_at(workflow, &config, &forged, now)
        .await
        .expect_err("forged signature rejected");
    assert!(matches!(err, OrcheoError::WebhookAuthentication(_)));
}

#[tokio::test]
async fn hmac_signs_canonical_json_for_mappings() {
    // key order must not matter: both payload spellings verify against
    // the same signature
    let config = hmac_config();
    let now = Utc::now();
    let signature_a = compute_signature(
        HmacAlgorithm::Sha256,
        "s",
        Some(&now.timestamp().to_string()),
        &WebhookPayload::Json(json!({"a": 1, "b": 2})),
    )
    .expect("signature");
    let signature_b = compute_signature(
        HmacAlgorithm::Sha256,
        "s",
        Some(&now.timestamp().to_string()),
        &WebhookPayload::Json(json!({"b": 2, "a": 1})),
    )
    .expect("signature");
    assert_eq!(signature_a, signature_b);

    // raw payloads sign their bytes untouched
    let text = compute_signature(
        HmacAlgorithm::Sha256,
        "s",
        None,
        &WebhookPayload::Text("raw body".to_string()),
    )
    .expect("signature");
    let bytes = compute_signature(
        HmacAlgorithm::Sha256,
        "s",
        None,
        &WebhookPayload::Bytes(b"raw body".to_vec()),
    )
    .expect("signature");
    assert_eq!(text, bytes);
}

#[tokio::test]
async fn rate_limit_boundary_and_window_reset() {
    let admission = WebhookAdmission::new();
    let config = WebhookTriggerConfig {
        rate_limit: Some(WebhookRateLimit {
            limit: 3,
            interval_seconds: 60,
        }),
        ..WebhookTriggerConfig::default()
    };
    let workflow = Uuid::new_v4();
    let request = request_with_headers(&[]);
    let now = Utc::now();

    for n in 0..3 {
        admission
            .admit_at(workflow, &config, &request, now + Duration::seconds(n))
            .await
            .expect("within limit");
    }
    let err = admission
        .admit_at(workflow, &config, &request, now + Duration::seconds(3))
        .await
        .expect_err("limit exceeded");
    assert!(matches!(err, OrcheoError::RateLimitExceeded(_)));

    // once the interval has elapsed the window resets
    admission
        .admit_at(workflow, &config, &request, now + Duration::seconds(61))
        .await
        .expect("window reset");
}

#[tokio::test]
async fn rate_limit_state_is_scoped_per_workflow() {
    let admission = WebhookAdmission::new();
    let config = WebhookTriggerConfig {
        rate_limit: Some(WebhookRateLimit {
            limit: 1,
            interval_seconds: 60,
        }),
        ..WebhookTriggerConfig::default()
    };
    let request = request_with_headers(&[]);
    let now = Utc::now();
    let first = Uuid::new_v4();
    let second = Uuid::new_v4();

    admission
        .admit_at(first, &config, &request, now)
        .await
        .expect("first workflow");
    assert!(admission.admit_at(first, &config, &request, now).await.is_err());
    admission
        .admit_at(second, &config, &request, now)
        .await
        .expect("other workflow unaffected");
}

#[tokio::test]
async fn missing_timestamp_header_is_an_authentication_failure() {
    let admission = WebhookAdmission::new();
    let config = hmac_config();
    let signature = compute_signature(
        HmacAlgorithm::Sha256,
        "s",
        None,
        &WebhookPayload::Json(json!({"foo": "bar"})),
    )
    .expect("signature");
    let request = request_with_headers(&[("x-sig", signature.as_str())]);
    let err = admission
        .admit(Uuid::new_v4(), &config, &request)
        .await
        .expect_err("timestamp required");
    assert!(matches!(err, OrcheoError::WebhookAuthentication(_)));
}
