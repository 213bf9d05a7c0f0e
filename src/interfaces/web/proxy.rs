//! Inbound webhook proxy: resolves a plugin webhook, applies rate
//! limiting and signature verification, then forwards the request over
//! loopback to the worker's route surface.

use axum::{
    Json,
    extract::{Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

use super::AppState;
use crate::core::error::OrchestratorError;
use crate::worker::plugin::WebhookSpec;

type HmacSha256 = Hmac<Sha256>;

const FORWARD_TIMEOUT: Duration = Duration::from_secs(10);

/// Response headers never relayed between hops.
const HOP_HEADERS: [&str; 3] = ["host", "connection", "content-length"];

pub(crate) async fn handle_webhook(
    Path((plugin_id, path)): Path<(String, String)>,
    State(state): State<AppState>,
    method: Method,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: String,
) -> Response {
    let Some(manifest) = state.manifests.get(&plugin_id) else {
        return error_response(StatusCode::NOT_FOUND, "unknown plugin");
    };
    let Some(webhook) = find_webhook(manifest.webhooks.as_slice(), &path, method.as_str()) else {
        return error_response(StatusCode::NOT_FOUND, "no matching webhook");
    };

    let organization_id = query
        .get("org")
        .cloned()
        .or_else(|| header_value(&headers, "x-organization-id"));
    let Some(organization_id) = organization_id else {
        return error_response(StatusCode::BAD_REQUEST, "organization identifier required");
    };

    if !state.rate_limiter.check(&plugin_id, &organization_id).await {
        warn!(
            "Rate limit exceeded for {}/{}",
            organization_id, plugin_id
        );
        return taxonomy_response(&OrchestratorError::RateLimited(plugin_id));
    }

    match state.store.get_instance(&plugin_id, &organization_id).await {
        Ok(Some(instance)) if instance.enabled => {}
        Ok(_) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "no enabled plugin instance for this organization",
            );
        }
        Err(e) => {
            warn!("Instance lookup failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "instance lookup failed");
        }
    }

    if let Some(signature_header) = &webhook.signature_header {
        let secret = match resolve_secret(&state, &organization_id, &plugin_id, webhook).await {
            Ok(Some(secret)) => secret,
            Ok(None) => {
                warn!(
                    "No signing secret configured for {}/{} webhook '{}'",
                    organization_id, plugin_id, webhook.path
                );
                return taxonomy_response(&OrchestratorError::Signature);
            }
            Err(e) => {
                warn!("Secret resolution failed: {}", e);
                return error_response(StatusCode::INTERNAL_SERVER_ERROR, "secret lookup failed");
            }
        };
        let provided = header_value(&headers, signature_header);
        let verified = provided
            .map(|sig| verify_signature(signature_header, &sig, &body, &secret))
            .unwrap_or(false);
        if !verified {
            return taxonomy_response(&OrchestratorError::Signature);
        }
    }

    if let Err(e) = state
        .pool
        .ensure_instance_running(&organization_id, &plugin_id)
        .await
    {
        return taxonomy_response(&e);
    }
    state
        .pool
        .update_activity(&organization_id, &plugin_id)
        .await;

    let Some(port) = state.pool.worker_port(&organization_id, &plugin_id).await else {
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "worker port unknown");
    };

    info!(
        "Forwarding webhook {} /{} to {}/{} (port {})",
        method, path, organization_id, plugin_id, port
    );
    forward_to_worker(&state, port, &path, method, &headers, &query, body).await
}

fn find_webhook<'a>(
    webhooks: &'a [WebhookSpec],
    path: &str,
    method: &str,
) -> Option<&'a WebhookSpec> {
    webhooks.iter().find(|webhook| {
        webhook.path.trim_start_matches('/') == path.trim_start_matches('/')
            && webhook.method.eq_ignore_ascii_case(method)
    })
}

async fn resolve_secret(
    state: &AppState,
    organization_id: &str,
    plugin_id: &str,
    webhook: &WebhookSpec,
) -> anyhow::Result<Option<String>> {
    let Some(secret_key) = &webhook.secret_key else {
        return Ok(None);
    };
    let env = state.store.merged_env(organization_id, plugin_id).await?;
    Ok(env.get(secret_key).cloned())
}

async fn forward_to_worker(
    state: &AppState,
    port: u16,
    path: &str,
    method: Method,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: String,
) -> Response {
    let url = format!("http://127.0.0.1:{}/routes/{}", port, path);
    let method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(method) => method,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unsupported method"),
    };

    let mut request = state
        .http
        .request(method, &url)
        .timeout(FORWARD_TIMEOUT)
        .query(query)
        .body(body);
    for (name, value) in headers {
        if HOP_HEADERS.contains(&name.as_str()) {
            continue;
        }
        if let Ok(value) = value.to_str() {
            request = request.header(name.as_str(), value);
        }
    }

    let response = match request.send().await {
        Ok(response) => response,
        Err(e) => {
            warn!("Worker forward failed: {}", e);
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, "worker unreachable");
        }
    };

    let status =
        StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut relayed = HeaderMap::new();
    for (name, value) in response.headers() {
        if HOP_HEADERS.contains(&name.as_str()) || name.as_str() == "transfer-encoding" {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            relayed.insert(name, value);
        }
    }
    let body = response.bytes().await.unwrap_or_default();
    (status, relayed, body).into_response()
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Rejections with a taxonomy variant derive status and message from it.
fn taxonomy_response(error: &OrchestratorError) -> Response {
    let status =
        StatusCode::from_u16(error.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    error_response(status, &error.to_string())
}

// === Signature verification ===

/// Scheme is selected by the header name the webhook declared, not a
/// config flag: Stripe's `t=...,v1=...` format, GitHub's `sha256=` prefix,
/// or plain HMAC-SHA256 hex for anything else.
pub(crate) fn verify_signature(header_name: &str, signature: &str, body: &str, secret: &str) -> bool {
    let name = header_name.to_ascii_lowercase();
    if name == "stripe-signature" {
        return verify_stripe(signature, body, secret);
    }
    if name == "x-hub-signature-256" {
        let Some(hex_sig) = signature.strip_prefix("sha256=") else {
            return false;
        };
        return constant_time_eq(hex_sig.as_bytes(), hmac_hex(body, secret).as_bytes());
    }
    constant_time_eq(signature.as_bytes(), hmac_hex(body, secret).as_bytes())
}

fn verify_stripe(signature: &str, body: &str, secret: &str) -> bool {
    let parts: HashMap<&str, &str> = signature
        .split(',')
        .filter_map(|p| p.split_once('='))
        .collect();
    let (Some(timestamp), Some(v1_sig)) = (parts.get("t"), parts.get("v1")) else {
        return false;
    };
    let signed_payload = format!("{}.{}", timestamp, body);
    constant_time_eq(
        v1_sig.as_bytes(),
        hmac_hex(&signed_payload, secret).as_bytes(),
    )
}

fn hmac_hex(payload: &str, secret: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
