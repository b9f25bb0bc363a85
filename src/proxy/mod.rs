// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Proxy engine
//
// Admission (auth, body cap), request scan, upstream dispatch, response mode
// selection, and the error surface. Handlers depend on the HttpSender trait
// so tests run against mock upstreams.

pub mod headers;
pub mod streaming;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use bytes::Bytes;
use flate2::read::{DeflateDecoder, GzDecoder};
use futures_util::StreamExt;
use std::io::Read as _;
use tokio::sync::Semaphore;

use crate::allowlist::Allowlist;
use crate::audit::{AuditEvent, AuditHandle, Direction, SqliteAuditStore};
use crate::auth::{extract_key, KeyStore, RateLimiter};
use crate::config::Config;
use crate::metrics::Metrics;
use crate::scanner::calibration::CalibrationResult;
use crate::scanner::gate::{ScanContext, ScanGate};
use crate::scanner::nlp::NlpScanner;
use crate::scanner::{new_scan_id, ScanResult};
use crate::upstream::{HttpSender, UpstreamBody, UpstreamError, UpstreamRequest};

use headers::{build_client_response_headers, build_upstream_headers, BLOCK_HEADER, SCAN_ID_HEADER};
use streaming::{scan_sse_stream, StreamScanContext};

/// Request bodies above this are rejected with 413 before scanning.
pub const MAX_REQUEST_BODY_BYTES: usize = 1_048_576;

/// Responses with a declared length above this are never buffered.
pub const MAX_RESPONSE_BUFFER_BYTES: u64 = 524_288;

/// Concurrent connection cap, matched to the upstream pool size.
pub const MAX_CONCURRENT_REQUESTS: usize = 100;

// ---------------------------------------------------------------------------
// Domain types
// ---------------------------------------------------------------------------

/// Wire format detected from the request path. `OpenAi` covers any provider
/// using the OpenAI-compatible chat completions API; `Anthropic` covers the
/// Anthropic messages API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    OpenAi,
    Anthropic,
}

pub fn detect_provider(path: &str) -> Option<Provider> {
    if path.starts_with("/v1/chat/completions") {
        Some(Provider::OpenAi)
    } else if path.starts_with("/v1/messages") {
        Some(Provider::Anthropic)
    } else {
        None
    }
}

/// Errors surfaced by the admission and dispatch path. Scan blocks are not
/// errors — they get their own response shape.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("missing or invalid API key")]
    AuthFailure,

    #[error("request body too large")]
    BodyTooLarge,

    #[error("request body is not valid JSON")]
    MalformedRequest,

    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    #[error("upstream timed out: {0}")]
    UpstreamTimeout(String),

    #[error("too many requests")]
    RateLimited,

    #[error("service is starting")]
    NotReady,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ProxyError::AuthFailure => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Missing or invalid OnGarde API key",
            ),
            ProxyError::BodyTooLarge => (
                StatusCode::PAYLOAD_TOO_LARGE,
                "payload_too_large",
                "Request body too large. Maximum size: 1MiB",
            ),
            ProxyError::MalformedRequest => (
                StatusCode::BAD_REQUEST,
                "bad_request",
                "Request body is not valid JSON",
            ),
            ProxyError::UpstreamUnreachable(_) => (
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                "Upstream LLM provider unavailable",
            ),
            ProxyError::UpstreamTimeout(_) => (
                StatusCode::BAD_GATEWAY,
                "upstream_unavailable",
                "Upstream LLM provider timed out",
            ),
            ProxyError::RateLimited => (
                StatusCode::TOO_MANY_REQUESTS,
                "rate_limited",
                "Too many key management requests",
            ),
            ProxyError::NotReady => (
                StatusCode::SERVICE_UNAVAILABLE,
                "starting",
                "OnGarde is starting up",
            ),
        };
        let body = serde_json::json!({
            "error": { "message": message, "code": code }
        });
        (status, axum::Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub gate: Arc<ScanGate>,
    pub sender: Arc<dyn HttpSender>,
    pub keys: Arc<KeyStore>,
    pub audit: AuditHandle,
    pub audit_store: Arc<SqliteAuditStore>,
    pub metrics: Arc<Metrics>,
    pub nlp: Option<Arc<NlpScanner>>,
    pub calibration: Arc<CalibrationResult>,
    pub allowlist: Arc<Allowlist>,
    pub limiter: Arc<RateLimiter>,
    pub ready: Arc<AtomicBool>,
    pub conn_permits: Arc<Semaphore>,
}

impl AppState {
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Build the full router: proxy endpoints, health, and the loopback-only
/// dashboard surface.
pub fn build_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/v1/chat/completions", post(proxy_handler))
        .route("/v1/messages", post(proxy_handler))
        .merge(crate::health::router())
        .merge(crate::dashboard::router());

    if std::env::var("DEBUG").is_ok() {
        router = router.merge(crate::health::docs_router());
    }

    router.with_state(state)
}

// ---------------------------------------------------------------------------
// Proxy handler
// ---------------------------------------------------------------------------

async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    if !state.is_ready() {
        return ProxyError::NotReady.into_response();
    }

    // Saturated connection cap answers 503 instead of queueing
    let Ok(_permit) = state.conn_permits.clone().try_acquire_owned() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            axum::Json(serde_json::json!({
                "error": { "message": "Connection limit reached", "code": "overloaded" }
            })),
        )
            .into_response();
    };

    let path = request.uri().path().to_string();
    let provider = match detect_provider(&path) {
        Some(p) => p,
        None => return (StatusCode::NOT_FOUND, "unknown path").into_response(),
    };

    // ── Auth ────────────────────────────────────────────────────────────
    let key_id = match authenticate(&state, request.headers()).await {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };

    state.metrics.record_request();
    let scan_id = new_scan_id();

    // ── Body cap ────────────────────────────────────────────────────────
    // Content-Length fast path first, then a hard limit on the actual read
    // for chunked bodies.
    if let Some(declared) = content_length(request.headers()) {
        if declared > MAX_REQUEST_BODY_BYTES as u64 {
            return ProxyError::BodyTooLarge.into_response();
        }
    }
    let headers = request.headers().clone();
    let body = match axum::body::to_bytes(request.into_body(), MAX_REQUEST_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => return ProxyError::BodyTooLarge.into_response(),
    };

    // ── Request scan ────────────────────────────────────────────────────
    let text = match extract_scannable_text(&body) {
        Ok(t) => t,
        Err(e) => return e.into_response(),
    };

    let upstream_base = upstream_base_url(&state.config, provider);
    let scan_ctx = ScanContext {
        direction: Direction::Request,
        key_id: key_id.clone(),
        upstream: Some(upstream_base.clone()),
    };
    let result = state.gate.scan_or_block(&text, &scan_id, scan_ctx).await;

    if result.decision.is_block() || result.suppressed_by_allowlist {
        state.audit.emit(AuditEvent::from_scan(
            &result,
            Direction::Request,
            &key_id,
            Some(&upstream_base),
            false,
        ));
    }
    if result.decision.is_block() {
        state.metrics.record_block(result.risk_level, result.test);
        tracing::info!(
            scan_id = %scan_id,
            rule_id = result.rule_id.as_deref().unwrap_or(""),
            path = %path,
            "request blocked"
        );
        return block_response(&result);
    }

    // ── Upstream dispatch ───────────────────────────────────────────────
    let upstream_url = format!("{}{}", upstream_base.trim_end_matches('/'), path);
    let upstream_headers = build_upstream_headers(&headers, &scan_id, provider, &state.config);
    // Logging and counters only — fingerprints never cache scan results
    let fingerprint = request_fingerprint(&key_id, &upstream_base, &body);

    let upstream_response = match state
        .sender
        .send(UpstreamRequest {
            method: axum::http::Method::POST,
            url: upstream_url.clone(),
            headers: upstream_headers,
            body,
        })
        .await
    {
        Ok(resp) => resp,
        Err(UpstreamError::Timeout(msg)) => {
            tracing::warn!(scan_id = %scan_id, upstream = %upstream_url, error = %msg,
                "upstream timeout");
            return ProxyError::UpstreamTimeout(msg).into_response();
        }
        Err(UpstreamError::Transport(msg)) => {
            tracing::warn!(scan_id = %scan_id, upstream = %upstream_url, error = %msg,
                "upstream unreachable");
            return ProxyError::UpstreamUnreachable(msg).into_response();
        }
    };

    tracing::info!(
        scan_id = %scan_id,
        path = %path,
        fingerprint = %fingerprint,
        status = upstream_response.status.as_u16(),
        "request proxied"
    );

    // ── Response mode selection ─────────────────────────────────────────
    let content_type = upstream_response
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let is_sse = content_type.contains("text/event-stream");
    let declared_len = content_length(&upstream_response.headers);
    let large = declared_len.map(|l| l > MAX_RESPONSE_BUFFER_BYTES).unwrap_or(false);
    let chunked_unsized = declared_len.is_none();

    let mut response_headers = build_client_response_headers(&upstream_response.headers);
    if let Ok(value) = HeaderValue::from_str(&scan_id) {
        response_headers.insert(SCAN_ID_HEADER, value);
    }

    if is_sse || large || chunked_unsized {
        let input = match upstream_response.body {
            UpstreamBody::Full(bytes) => {
                futures_util::stream::once(async move { Ok::<_, UpstreamError>(bytes) }).boxed()
            }
            UpstreamBody::Stream(s) => s.boxed(),
        };
        let scanned = scan_sse_stream(
            input,
            StreamScanContext {
                scan_id,
                key_id,
                upstream: upstream_base,
                audit: state.audit.clone(),
                metrics: state.metrics.clone(),
                nlp: state.nlp.clone(),
            },
        );
        // Content-Length no longer applies once the scanner can truncate
        response_headers.remove("content-length");

        let body = Body::from_stream(scanned.map(Ok::<Bytes, std::io::Error>));
        let mut response = Response::builder().status(upstream_response.status);
        if let Some(h) = response.headers_mut() {
            *h = response_headers;
        }
        return response.body(body).unwrap().into_response();
    }

    // ── Buffered path: scan before a single byte reaches the client ────
    let raw_body = match read_full_body(upstream_response.body).await {
        Ok(b) => b,
        Err(e) => return ProxyError::UpstreamUnreachable(e.to_string()).into_response(),
    };
    let body_bytes = match maybe_decompress(&mut response_headers, raw_body) {
        Ok(b) => b,
        Err(msg) => return ProxyError::UpstreamUnreachable(msg).into_response(),
    };

    if !body_bytes.is_empty() {
        let response_text = String::from_utf8_lossy(&body_bytes);
        let scan = state
            .gate
            .scan_buffered_response(&response_text, &scan_id)
            .await;

        if scan.decision.is_block() || scan.suppressed_by_allowlist {
            state.audit.emit(AuditEvent::from_scan(
                &scan,
                Direction::Response,
                &key_id,
                Some(&upstream_base),
                false,
            ));
        }
        if scan.decision.is_block() {
            state.metrics.record_block(scan.risk_level, scan.test);
            tracing::info!(
                scan_id = %scan_id,
                rule_id = scan.rule_id.as_deref().unwrap_or(""),
                "response body blocked"
            );
            return block_response(&scan);
        }
    }

    response_headers.remove("content-length");
    let mut response = Response::builder().status(upstream_response.status);
    if let Some(h) = response.headers_mut() {
        *h = response_headers;
    }
    response.body(Body::from(body_bytes)).unwrap().into_response()
}

async fn authenticate(
    state: &AppState,
    headers: &axum::http::HeaderMap,
) -> Result<String, ProxyError> {
    if !state.config.auth_required {
        return Ok("anonymous".to_string());
    }
    let key = extract_key(headers).ok_or(ProxyError::AuthFailure)?;
    if !key.starts_with(crate::auth::KEY_PREFIX) {
        return Err(ProxyError::AuthFailure);
    }
    // bcrypt verification is deliberately slow — keep it off the async workers
    let keys = state.keys.clone();
    let verified = tokio::task::spawn_blocking(move || keys.verify(&key))
        .await
        .map_err(|_| ProxyError::AuthFailure)?;
    verified.ok_or(ProxyError::AuthFailure)
}

// ---------------------------------------------------------------------------
// Block response surface
// ---------------------------------------------------------------------------

/// HTTP 400 block response in the OpenAI-compatible error shape with the
/// OnGarde extension object. Never contains the raw matched content.
pub fn block_response(result: &ScanResult) -> Response {
    let body = serde_json::json!({
        "error": {
            "message": "Request blocked by OnGarde security policy",
            "code": "ongarde_block",
            "ongarde": {
                "blocked": true,
                "rule_id": result.rule_id,
                "risk_level": result.risk_level.map(|r| r.as_str()),
                "scan_id": result.scan_id,
                "test": result.test,
                "redacted_excerpt": result.redacted_excerpt,
                "suppression_hint": result.suppression_hint,
            }
        }
    });

    let mut response = (StatusCode::BAD_REQUEST, axum::Json(body)).into_response();
    let headers = response.headers_mut();
    headers.insert(BLOCK_HEADER, HeaderValue::from_static("true"));
    if let Ok(value) = HeaderValue::from_str(&result.scan_id) {
        headers.insert(SCAN_ID_HEADER, value);
    }
    response
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Correlation fingerprint: caller key id, upstream target, and body hash.
fn request_fingerprint(key_id: &str, upstream: &str, body: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(key_id.as_bytes());
    hasher.update(b"\x00");
    hasher.update(upstream.as_bytes());
    hasher.update(b"\x00");
    hasher.update(body);
    let digest = hasher.finalize();
    let hex = format!("{digest:x}");
    hex[..16].to_string()
}

fn content_length(headers: &axum::http::HeaderMap) -> Option<u64> {
    headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
}

fn upstream_base_url(config: &Config, provider: Provider) -> String {
    match provider {
        Provider::OpenAi => config
            .upstream
            .custom
            .clone()
            .unwrap_or_else(|| config.upstream.openai.clone()),
        Provider::Anthropic => config.upstream.anthropic.clone(),
    }
}

async fn read_full_body(body: UpstreamBody) -> Result<Bytes, UpstreamError> {
    match body {
        UpstreamBody::Full(bytes) => Ok(bytes),
        UpstreamBody::Stream(mut s) => {
            let mut collected = Vec::new();
            while let Some(chunk) = s.next().await {
                collected.extend_from_slice(&chunk?);
            }
            Ok(Bytes::from(collected))
        }
    }
}

/// Extract the user-visible text from an OpenAI- or Anthropic-shaped body:
/// `messages[*].content` (strings and content-part arrays) plus the
/// top-level `system` field.
pub fn extract_scannable_text(body: &Bytes) -> Result<String, ProxyError> {
    let json: serde_json::Value =
        serde_json::from_slice(body).map_err(|_| ProxyError::MalformedRequest)?;

    let mut parts: Vec<String> = Vec::new();

    match json.get("system") {
        Some(serde_json::Value::String(s)) => parts.push(s.clone()),
        Some(serde_json::Value::Array(blocks)) => {
            for block in blocks {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    parts.push(text.to_string());
                }
            }
        }
        _ => {}
    }

    if let Some(messages) = json.get("messages").and_then(|m| m.as_array()) {
        for message in messages {
            match message.get("content") {
                Some(serde_json::Value::String(s)) => parts.push(s.clone()),
                Some(serde_json::Value::Array(items)) => {
                    for item in items {
                        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                            parts.push(text.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    Ok(parts.join("\n"))
}

/// Decompress a gzip/deflate body so the scanner sees plaintext JSON.
/// Strips Content-Encoding and Content-Length from the forwarded headers.
fn maybe_decompress(
    headers: &mut axum::http::HeaderMap,
    body: Bytes,
) -> Result<Bytes, String> {
    let encoding = headers
        .get("content-encoding")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_ascii_lowercase());

    let decompressed = match encoding.as_deref() {
        Some("gzip") => {
            let mut decoder = GzDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| format!("gzip decompression failed: {e}"))?;
            Bytes::from(out)
        }
        Some("deflate") => {
            let mut decoder = DeflateDecoder::new(&body[..]);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| format!("deflate decompression failed: {e}"))?;
            Bytes::from(out)
        }
        _ => return Ok(body),
    };

    headers.remove("content-encoding");
    headers.remove("content-length");
    Ok(decompressed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_detection() {
        assert_eq!(detect_provider("/v1/chat/completions"), Some(Provider::OpenAi));
        assert_eq!(detect_provider("/v1/messages"), Some(Provider::Anthropic));
        assert_eq!(detect_provider("/v1/embeddings"), None);
        assert_eq!(detect_provider("/"), None);
    }

    #[test]
    fn extracts_openai_message_content() {
        let body = Bytes::from(
            r#"{"model":"gpt-4","messages":[{"role":"user","content":"hello there"}]}"#,
        );
        assert_eq!(extract_scannable_text(&body).unwrap(), "hello there");
    }

    #[test]
    fn extracts_nested_content_parts_and_system() {
        let body = Bytes::from(
            r#"{"system":"be helpful","messages":[
                {"role":"user","content":[{"type":"text","text":"part one"},{"type":"image","source":{}}]},
                {"role":"assistant","content":"reply"}
            ]}"#,
        );
        let text = extract_scannable_text(&body).unwrap();
        assert_eq!(text, "be helpful\npart one\nreply");
    }

    #[test]
    fn anthropic_system_blocks_extracted() {
        let body = Bytes::from(
            r#"{"system":[{"type":"text","text":"system rules"}],"messages":[{"role":"user","content":"hi"}]}"#,
        );
        let text = extract_scannable_text(&body).unwrap();
        assert!(text.contains("system rules"));
        assert!(text.contains("hi"));
    }

    #[test]
    fn malformed_json_rejected() {
        let body = Bytes::from("this is not json {{{");
        assert!(matches!(
            extract_scannable_text(&body),
            Err(ProxyError::MalformedRequest)
        ));
    }

    #[test]
    fn proxy_error_status_mapping() {
        assert_eq!(
            ProxyError::AuthFailure.into_response().status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ProxyError::BodyTooLarge.into_response().status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            ProxyError::UpstreamUnreachable("x".into())
                .into_response()
                .status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            ProxyError::RateLimited.into_response().status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            ProxyError::NotReady.into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn block_response_carries_headers_and_shape() {
        let result = ScanResult {
            decision: crate::scanner::Decision::Block,
            scan_id: "01SCANID".to_string(),
            rule_id: Some("CREDENTIAL_DETECTED".to_string()),
            risk_level: Some(crate::scanner::RiskLevel::Critical),
            redacted_excerpt: Some("[REDACTED:x]".to_string()),
            suppression_hint: None,
            origin: crate::scanner::ScanOrigin::FastPath,
            test: false,
            suppressed_by_allowlist: false,
            tokens_delivered: None,
        };
        let response = block_response(&result);
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers().get(BLOCK_HEADER).unwrap(), "true");
        assert_eq!(response.headers().get(SCAN_ID_HEADER).unwrap(), "01SCANID");
    }

    #[test]
    fn gzip_decompression_strips_headers() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        use std::io::Write;

        let json = r#"{"ok":true}"#;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::fast());
        encoder.write_all(json.as_bytes()).unwrap();
        let compressed = encoder.finish().unwrap();

        let mut headers = axum::http::HeaderMap::new();
        headers.insert("content-encoding", HeaderValue::from_static("gzip"));
        headers.insert("content-length", HeaderValue::from_static("999"));

        let out = maybe_decompress(&mut headers, Bytes::from(compressed)).unwrap();
        assert_eq!(&out[..], json.as_bytes());
        assert!(headers.get("content-encoding").is_none());
        assert!(headers.get("content-length").is_none());
    }

    #[test]
    fn fingerprint_is_stable_and_input_sensitive() {
        let a = request_fingerprint("key1", "https://api.openai.com", b"{}");
        let b = request_fingerprint("key1", "https://api.openai.com", b"{}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 16);

        let c = request_fingerprint("key2", "https://api.openai.com", b"{}");
        assert_ne!(a, c);
        let d = request_fingerprint("key1", "https://api.openai.com", b"{ }");
        assert_ne!(a, d);
    }

    #[test]
    fn passthrough_without_encoding() {
        let mut headers = axum::http::HeaderMap::new();
        let body = Bytes::from_static(b"plain");
        let out = maybe_decompress(&mut headers, body.clone()).unwrap();
        assert_eq!(out, body);
    }
}
