//! Order backend API client.
//!
//! Provides authenticated HTTP communication with the order backend, used for
//! shipping quotes, exchange rates, and order create/update/delete calls.
//! All endpoints live under `/api/v1/...` (and `/api/v1/admin/...`).

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::{db, storage};

/// Default timeout for API requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity test.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Header carrying the backend API key.
const API_KEY_HEADER: &str = "X-Api-Key";

/// Where and how to reach the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTarget {
    pub base_url: String,
    pub api_key: String,
}

impl ApiTarget {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        let resolved_key = extract_api_key_from_connection_string(api_key)
            .unwrap_or_else(|| api_key.trim().to_string());
        Self {
            base_url: normalize_admin_url(base_url),
            api_key: resolved_key,
        }
    }

    /// Resolve the backend target from the credential store, falling back to
    /// the `api` category of local settings.
    pub fn resolve(db: &db::DbState) -> Result<Self, String> {
        let local = |key: &str| -> Option<String> {
            let conn = db.conn.lock().ok()?;
            db::get_setting(&conn, "api", key)
        };
        let base_url = storage::get_credential(storage::KEY_ADMIN_URL)
            .or_else(|| local(storage::KEY_ADMIN_URL))
            .filter(|s| !s.trim().is_empty())
            .ok_or("Backend URL is not configured")?;
        let api_key = storage::get_credential(storage::KEY_API_KEY)
            .or_else(|| local(storage::KEY_API_KEY))
            .filter(|s| !s.trim().is_empty())
            .ok_or("Backend API key is not configured")?;
        Ok(Self::new(&base_url, &api_key))
    }
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the backend URL:
/// - strip trailing slashes
/// - strip a trailing `/api` or `/api/v1` segment
/// - ensure a scheme is present (https, or http for localhost)
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api/v1") {
        url.truncate(url.len() - 7);
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

fn decode_connection_string_payload(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if trimmed.starts_with('{') {
        return serde_json::from_str::<Value>(trimmed).ok();
    }

    let compact: String = trimmed.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str::<Value>(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }

    let base64 = compact.replace('-', "+").replace('_', "/");
    let padded = format!(
        "{}{}",
        base64,
        "=".repeat((4usize.wrapping_sub(base64.len() % 4)) % 4)
    );
    let decoded = BASE64_STANDARD.decode(padded).ok()?;
    serde_json::from_slice::<Value>(&decoded).ok()
}

/// Pull the API key out of an onboarding connection string (`{"url","key"}`
/// as JSON or URL-safe base64).
pub fn extract_api_key_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("key")
                .and_then(Value::as_str)
                .map(|s| s.trim().to_string())
        })
        .filter(|s| !s.is_empty())
}

pub fn extract_admin_url_from_connection_string(raw: &str) -> Option<String> {
    decode_connection_string_payload(raw)
        .and_then(|v| {
            v.get("url")
                .and_then(Value::as_str)
                .map(normalize_admin_url)
        })
        .filter(|s| !s.is_empty())
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly message.
fn friendly_error(url: &str, err: &reqwest::Error) -> String {
    if err.is_connect() {
        return format!("Cannot reach order backend at {url}");
    }
    if err.is_timeout() {
        return format!("Connection to {url} timed out");
    }
    if err.is_builder() {
        return format!("Invalid order backend URL: {url}");
    }
    format!("Network error communicating with {url}: {err}")
}

/// Convert an HTTP status code into a user-friendly message.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Not authorized for this operation".to_string(),
        404 => "Order backend endpoint not found".to_string(),
        422 => "Validation failed".to_string(),
        s if s >= 500 => "Order backend server error".to_string(),
        _ => "Unexpected response from order backend".to_string(),
    }
}

/// Build the message shown to the user for a failed response. The raw
/// response text is always preserved so the dialog shows what the server said.
fn failure_detail(status: StatusCode, body_text: &str) -> String {
    let trimmed = body_text.trim();
    if trimmed.is_empty() {
        return format!("{} (HTTP {})", status_error(status), status.as_u16());
    }
    let message = serde_json::from_str::<Value>(trimmed).ok().and_then(|json| {
        json.get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    });
    match message {
        Some(message) if message != trimmed => {
            format!("{message} (HTTP {}): {trimmed}", status.as_u16())
        }
        _ => format!("{} (HTTP {}): {trimmed}", status_error(status), status.as_u16()),
    }
}

/// Map a server validation payload to `field -> message`.
///
/// Accepts `{"errors": {"field": ["msg", ...]}}`, `{"errors": {"field": "msg"}}`
/// and `{"errors": [{"field": "..", "message": ".."}]}`. The first message per
/// field wins.
pub fn parse_field_errors(body: &Value) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    let errors = body
        .get("errors")
        .or_else(|| body.get("details"))
        .unwrap_or(body);

    match errors {
        Value::Object(map) => {
            for (field, messages) in map {
                let first = match messages {
                    Value::String(s) => Some(s.clone()),
                    Value::Array(arr) => arr.iter().find_map(|m| m.as_str().map(str::to_string)),
                    _ => None,
                };
                if let Some(msg) = first.filter(|m| !m.trim().is_empty()) {
                    out.insert(field.clone(), msg);
                }
            }
        }
        Value::Array(arr) => {
            for entry in arr {
                let field = crate::value_str(entry, &["field", "name", "param"]);
                let message = crate::value_str(entry, &["message", "msg", "error"]);
                if let (Some(field), Some(message)) = (field, message) {
                    out.entry(field).or_insert(message);
                }
            }
        }
        _ => {}
    }
    out
}

/// Extract the field errors embedded in an error string produced by
/// [`request`] (the raw body follows the first `": "` after the status).
pub fn field_errors_from_message(message: &str) -> BTreeMap<String, String> {
    let Some(idx) = message.find("): ") else {
        return BTreeMap::new();
    };
    serde_json::from_str::<Value>(&message[idx + 3..])
        .map(|v| parse_field_errors(&v))
        .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Connectivity test
// ---------------------------------------------------------------------------

/// Result of a connectivity test.
#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectivityResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Test connectivity to the backend with a lightweight health-check.
pub async fn test_connectivity(target: &ApiTarget) -> ConnectivityResult {
    let health_url = format!("{}/api/v1/health", target.base_url);

    let client = match Client::builder().timeout(CONNECTIVITY_TIMEOUT).build() {
        Ok(c) => c,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(format!("Failed to create HTTP client: {e}")),
            };
        }
    };

    let start = Instant::now();
    let resp = match client
        .get(&health_url)
        .header(API_KEY_HEADER, &target.api_key)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => {
            return ConnectivityResult {
                success: false,
                latency_ms: None,
                error: Some(friendly_error(&target.base_url, &e)),
            };
        }
    };

    let latency = start.elapsed().as_millis() as u64;
    let status = resp.status();
    if status.is_success() {
        info!(latency_ms = latency, "connectivity test passed");
        ConnectivityResult {
            success: true,
            latency_ms: Some(latency),
            error: None,
        }
    } else {
        ConnectivityResult {
            success: false,
            latency_ms: Some(latency),
            error: Some(status_error(status)),
        }
    }
}

// ---------------------------------------------------------------------------
// Generic authenticated request
// ---------------------------------------------------------------------------

/// Perform an authenticated JSON request against the backend.
///
/// `path` includes the leading slash, e.g. `/api/v1/orders`. Returns the JSON
/// body, or `Value::Null` for an empty response.
pub async fn request(
    target: &ApiTarget,
    method: &str,
    path: &str,
    body: Option<&Value>,
) -> Result<Value, String> {
    let full_url = format!("{}{path}", target.base_url);
    let http_method: Method = method
        .to_uppercase()
        .parse()
        .map_err(|_| format!("Invalid HTTP method: {method}"))?;

    let client = Client::builder()
        .timeout(DEFAULT_TIMEOUT)
        .build()
        .map_err(|e| format!("Failed to create HTTP client: {e}"))?;

    let mut req = client
        .request(http_method, &full_url)
        .header(API_KEY_HEADER, &target.api_key)
        .header("Accept", "application/json");
    if let Some(b) = body {
        req = req.json(b);
    }

    debug!(method = %method, path = %path, "backend request");
    let resp = req
        .send()
        .await
        .map_err(|e| friendly_error(&target.base_url, &e))?;
    let status = resp.status();
    let body_text = resp.text().await.unwrap_or_default();

    if !status.is_success() {
        return Err(failure_detail(status, &body_text));
    }
    if body_text.trim().is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_str(&body_text).map_err(|e| format!("Invalid JSON from order backend: {e}"))
}
