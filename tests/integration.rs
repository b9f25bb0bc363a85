// Integration tests
//
// End-to-end tests exercising the full proxy pipeline:
// admission → request scan → upstream dispatch → response scan / streaming
// scan → client, plus the audit trail.
//
// Uses a mock HttpSender as the upstream and tower::ServiceExt::oneshot for
// in-process HTTP. Auth is disabled per-test unless the test is about auth.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::connect_info::MockConnectInfo;
use axum::http::{HeaderValue, Request, StatusCode};
use bytes::Bytes;
use tokio::sync::Semaphore;
use tower::ServiceExt;

use ongarde::allowlist::Allowlist;
use ongarde::audit::{start_pipeline, SqliteAuditStore};
use ongarde::auth::{KeyStore, RateLimiter};
use ongarde::config::Config;
use ongarde::metrics::Metrics;
use ongarde::proxy::{build_router, AppState, MAX_CONCURRENT_REQUESTS, MAX_REQUEST_BODY_BYTES};
use ongarde::scanner::calibration::derive_thresholds;
use ongarde::scanner::gate::ScanGate;
use ongarde::scanner::nlp::NlpScanner;
use ongarde::upstream::{
    HttpSender, UpstreamBody, UpstreamError, UpstreamRequest, UpstreamResponse,
};

// ---------------------------------------------------------------------------
// Mock upstream
// ---------------------------------------------------------------------------

type ResponseFactory = Box<dyn Fn() -> UpstreamResponse + Send + Sync>;

/// Mock upstream recording call count and the last forwarded request.
struct MockSender {
    factory: ResponseFactory,
    calls: AtomicUsize,
    last_headers: std::sync::Mutex<Option<axum::http::HeaderMap>>,
    last_body: std::sync::Mutex<Option<Bytes>>,
}

impl MockSender {
    fn new(factory: ResponseFactory) -> Arc<Self> {
        Arc::new(Self {
            factory,
            calls: AtomicUsize::new(0),
            last_headers: std::sync::Mutex::new(None),
            last_body: std::sync::Mutex::new(None),
        })
    }

    fn json_ok(body: &'static str) -> Arc<Self> {
        Self::new(Box::new(move || {
            let mut headers = axum::http::HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            headers.insert(
                "content-length",
                HeaderValue::from_str(&body.len().to_string()).unwrap(),
            );
            UpstreamResponse {
                status: StatusCode::OK,
                headers,
                body: UpstreamBody::Full(Bytes::from_static(body.as_bytes())),
            }
        }))
    }

    fn sse(frames: &'static [&'static str]) -> Arc<Self> {
        Self::new(Box::new(move || {
            let mut headers = axum::http::HeaderMap::new();
            headers.insert(
                "content-type",
                HeaderValue::from_static("text/event-stream"),
            );
            let stream = futures_util::stream::iter(
                frames
                    .iter()
                    .map(|f| Ok::<Bytes, UpstreamError>(Bytes::from_static(f.as_bytes()))),
            );
            UpstreamResponse {
                status: StatusCode::OK,
                headers,
                body: UpstreamBody::Stream(Box::pin(stream)),
            }
        }))
    }

    fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HttpSender for MockSender {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_headers.lock().unwrap() = Some(request.headers.clone());
        *self.last_body.lock().unwrap() = Some(request.body.clone());
        Ok((self.factory)())
    }
}

struct FailingSender;

#[async_trait]
impl HttpSender for FailingSender {
    async fn send(&self, _request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        Err(UpstreamError::Transport("connection refused".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Test harness
// ---------------------------------------------------------------------------

struct Harness {
    app: axum::Router,
    state: AppState,
}

fn harness_with(sender: Arc<dyn HttpSender>, config: Config) -> Harness {
    let allowlist_dir = tempfile::tempdir().unwrap();
    let allowlist_path = allowlist_dir.path().join("allowlist.yaml");
    // Keep the tempdir alive for the process lifetime
    std::mem::forget(allowlist_dir);
    harness_full(sender, config, &allowlist_path)
}

fn harness_full(
    sender: Arc<dyn HttpSender>,
    config: Config,
    allowlist_path: &std::path::Path,
) -> Harness {
    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new());
    let audit_store = Arc::new(SqliteAuditStore::open_in_memory().unwrap());
    let audit = start_pipeline(audit_store.clone(), None, metrics.clone());
    let allowlist = Allowlist::load(allowlist_path);
    let nlp = Some(Arc::new(NlpScanner::new(&config.scanner.entity_set)));

    let mut measurements = std::collections::BTreeMap::new();
    measurements.insert(128, 1.0);
    measurements.insert(512, 2.0);
    measurements.insert(1024, 4.0);
    let calibration = Arc::new(derive_thresholds(&measurements));

    let gate = Arc::new(ScanGate::new(
        &config,
        nlp.clone(),
        &calibration,
        allowlist.clone(),
        metrics.clone(),
        audit.clone(),
    ));

    let state = AppState {
        config,
        gate,
        sender,
        keys: Arc::new(KeyStore::open_in_memory().unwrap()),
        audit,
        audit_store,
        metrics,
        nlp,
        calibration,
        allowlist,
        limiter: Arc::new(RateLimiter::key_management()),
        ready: Arc::new(AtomicBool::new(true)),
        conn_permits: Arc::new(Semaphore::new(MAX_CONCURRENT_REQUESTS)),
    };

    let app = build_router(state.clone())
        .layer(MockConnectInfo(SocketAddr::from(([127, 0, 0, 1], 55555))));
    Harness { app, state }
}

fn no_auth_config() -> Config {
    Config {
        auth_required: false,
        ..Config::default()
    }
}

fn chat_request(content: &str) -> Request<Body> {
    let body = serde_json::json!({
        "model": "gpt-4",
        "messages": [{"role": "user", "content": content}],
    });
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

/// The audit writer drains on a blocking thread; poll briefly.
async fn wait_for_audit(state: &AppState, min_events: u64) {
    for _ in 0..50 {
        if state.audit_store.count_events().unwrap_or(0) >= min_events {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("audit events did not arrive");
}

// ---------------------------------------------------------------------------
// Scenario 1: credential leak in request, non-streaming
// ---------------------------------------------------------------------------

#[tokio::test]
async fn credential_in_request_blocks_before_upstream() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender.clone(), no_auth_config());

    let response = h
        .app
        .oneshot(chat_request(
            "here is my key sk-proj-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let scan_id_header = response
        .headers()
        .get("x-ongarde-scan-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();

    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "ongarde_block");
    let ongarde = &json["error"]["ongarde"];
    assert_eq!(ongarde["rule_id"], "CREDENTIAL_DETECTED");
    assert_eq!(ongarde["risk_level"], "CRITICAL");
    assert_eq!(ongarde["scan_id"], scan_id_header);
    let excerpt = ongarde["redacted_excerpt"].as_str().unwrap();
    assert!(!excerpt.contains("sk-proj-AAAA"));

    // Upstream never contacted
    assert_eq!(sender.call_count(), 0);

    // Exactly one audit event with the surfaced scan_id
    wait_for_audit(&h.state, 1).await;
    let events = h.state.audit_store.query_recent(10).unwrap();
    let matching: Vec<_> = events
        .iter()
        .filter(|e| e.scan_id == scan_id_header)
        .collect();
    assert_eq!(matching.len(), 1);
    assert_eq!(matching[0].action, "BLOCK");
}

// ---------------------------------------------------------------------------
// Scenario 2: dangerous shell pattern
// ---------------------------------------------------------------------------

#[tokio::test]
async fn shell_pattern_blocks_without_dispatch() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender.clone(), no_auth_config());

    let response = h
        .app
        .oneshot(chat_request("run: sudo rm -rf /"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    let ongarde = &json["error"]["ongarde"];
    assert_eq!(ongarde["rule_id"], "DANGEROUS_COMMAND_DETECTED");
    let risk = ongarde["risk_level"].as_str().unwrap();
    assert!(risk == "HIGH" || risk == "CRITICAL");
    assert_eq!(sender.call_count(), 0);
}

// ---------------------------------------------------------------------------
// Scenario 3: registered test credential
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_credential_blocks_without_counting() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender, no_auth_config());

    let response = h
        .app
        .oneshot(chat_request("checking sk-ongarde-test-fake-key-12345 now"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["ongarde"]["test"], true);

    // Block counters untouched, audit event tagged test
    assert_eq!(h.state.metrics.snapshot().blocks_all_time, 0);
    wait_for_audit(&h.state, 1).await;
    let events = h.state.audit_store.query_recent(10).unwrap();
    assert!(events[0].test);
}

// ---------------------------------------------------------------------------
// Scenario 4: allowlisted false positive
// ---------------------------------------------------------------------------

#[tokio::test]
async fn allowlisted_block_is_suppressed_and_forwarded() {
    let dir = tempfile::tempdir().unwrap();
    let allowlist_path = dir.path().join("allowlist.yaml");
    std::fs::write(&allowlist_path, "- text_contains: \"rm -rf /tmp/build\"\n").unwrap();

    let sender = MockSender::json_ok(r#"{"choices":[{"message":{"content":"done"}}]}"#);
    let h = harness_full(sender.clone(), no_auth_config(), &allowlist_path);

    let response = h
        .app
        .oneshot(chat_request("our cleanup step is: rm -rf /tmp/build"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(sender.call_count(), 1);

    wait_for_audit(&h.state, 1).await;
    let events = h.state.audit_store.query_recent(10).unwrap();
    let suppressed: Vec<_> = events
        .iter()
        .filter(|e| e.action == "ALLOW_SUPPRESSED")
        .collect();
    assert_eq!(suppressed.len(), 1);
    assert!(suppressed[0].suppressed_by_allowlist);
}

// ---------------------------------------------------------------------------
// Scenario 5: buffered response with PII
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buffered_response_with_pii_never_reaches_client() {
    let sender =
        MockSender::json_ok(r#"{"text":"contact me at jane.doe@example.com or 555-123-4567"}"#);
    let h = harness_with(sender, no_auth_config());

    let response = h.app.oneshot(chat_request("hello")).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = body_string(response).await;
    assert!(!body.contains("jane.doe@example.com"));
    assert!(body.contains("ongarde_block"));
    assert!(body.contains("PII") || body.contains("NLP_"));
}

// ---------------------------------------------------------------------------
// Scenario 6: streaming credential mid-stream
// ---------------------------------------------------------------------------

#[tokio::test]
async fn streaming_credential_aborts_with_done_then_block() {
    // The frame carrying the credential also fills the 512-char window, so
    // the scan fires before that frame is forwarded.
    let long_frame: &'static str = Box::leak(
        format!(
            "data: {{\"choices\":[{{\"delta\":{{\"content\":\"sk-proj-BBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBBB end {}\"}}}}]}}\n\n",
            "pad ".repeat(160)
        )
        .into_boxed_str(),
    );
    let frames: &'static [&'static str] = Box::leak(
        vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"sure here it is \"}}]}\n\n",
            long_frame,
            "data: {\"choices\":[{\"delta\":{\"content\":\"never seen\"}}]}\n\n",
        ]
        .into_boxed_slice(),
    );

    let sender = MockSender::sse(frames);
    let h = harness_with(sender, no_auth_config());

    let response = h.app.oneshot(chat_request("stream please")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = body_string(response).await;
    assert!(!body.contains("sk-proj-BBBB"));
    assert!(!body.contains("never seen"));

    let done_pos = body.find("data: [DONE]").expect("DONE frame");
    let block_pos = body.find("event: ongarde_block").expect("block event");
    assert!(done_pos < block_pos);

    let block_line = body[block_pos..]
        .lines()
        .find(|l| l.starts_with("data: "))
        .unwrap();
    let payload: serde_json::Value =
        serde_json::from_str(block_line.strip_prefix("data: ").unwrap()).unwrap();
    assert_eq!(payload["rule_id"], "CREDENTIAL_DETECTED");
    assert!(payload["tokens_delivered"].as_u64().unwrap() > 0);

    wait_for_audit(&h.state, 1).await;
    let events = h.state.audit_store.query_recent(10).unwrap();
    let block = events.iter().find(|e| e.action == "BLOCK").unwrap();
    assert!(block.was_streaming);
    assert!(block.tokens_delivered.unwrap() > 0);
}

// ---------------------------------------------------------------------------
// Round-trip: allowed request reaches the upstream byte-identical
// ---------------------------------------------------------------------------

#[tokio::test]
async fn allowed_request_round_trips_unchanged() {
    let sender = MockSender::json_ok(r#"{"choices":[{"message":{"content":"fine"}}]}"#);
    let h = harness_with(sender.clone(), no_auth_config());

    let body = r#"{"model":"gpt-4","messages":[{"role":"user","content":"write a haiku"}]}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .header("x-custom-header", "preserved")
        .body(Body::from(body))
        .unwrap();

    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let forwarded = sender.last_body.lock().unwrap().clone().unwrap();
    assert_eq!(&forwarded[..], body.as_bytes());

    let headers = sender.last_headers.lock().unwrap().clone().unwrap();
    assert_eq!(headers.get("x-custom-header").unwrap(), "preserved");
    assert!(headers.get("x-ongarde-scan-id").is_some());
    assert!(headers.get("x-ongarde-key").is_none());

    let out = body_string(response).await;
    assert!(out.contains("fine"));
}

// ---------------------------------------------------------------------------
// Body cap boundaries
// ---------------------------------------------------------------------------

fn sized_request(total_body_len: usize) -> Request<Body> {
    // JSON envelope padded so the body is exactly total_body_len bytes
    let skeleton = r#"{"model":"gpt-4","messages":[{"role":"user","content":""}]}"#;
    let filler_len = total_body_len - skeleton.len();
    let body = skeleton.replace(
        "\"content\":\"\"",
        &format!("\"content\":\"{}\"", "x".repeat(filler_len)),
    );
    assert_eq!(body.len(), total_body_len);
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(body))
        .unwrap()
}

#[tokio::test]
async fn body_exactly_at_cap_accepted() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender, no_auth_config());
    let response = h
        .app
        .oneshot(sized_request(MAX_REQUEST_BODY_BYTES))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn body_one_byte_over_cap_rejected() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender.clone(), no_auth_config());
    let response = h
        .app
        .oneshot(sized_request(MAX_REQUEST_BODY_BYTES + 1))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(sender.call_count(), 0);
}

// ---------------------------------------------------------------------------
// Auth
// ---------------------------------------------------------------------------

#[tokio::test]
async fn missing_key_rejected_when_auth_required() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender.clone(), Config::default());

    let response = h.app.oneshot(chat_request("hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(sender.call_count(), 0);
}

#[tokio::test]
async fn valid_key_admits_request() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender, Config::default());

    let (_, plaintext) = h.state.keys.create("test").unwrap();

    let body = r#"{"model":"gpt-4","messages":[{"role":"user","content":"hi"}]}"#;
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-ongarde-key", &plaintext)
        .body(Body::from(body))
        .unwrap();

    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn revoked_key_rejected() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender, Config::default());

    let (record, plaintext) = h.state.keys.create("test").unwrap();
    h.state.keys.revoke(&record.id).unwrap();

    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("x-ongarde-key", &plaintext)
        .body(Body::from(r#"{"messages":[]}"#))
        .unwrap();

    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

// ---------------------------------------------------------------------------
// Error surface
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upstream_unreachable_maps_to_502_without_block_header() {
    let h = harness_with(Arc::new(FailingSender), no_auth_config());
    let response = h.app.oneshot(chat_request("hello")).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert!(response.headers().get("x-ongarde-block").is_none());
}

#[tokio::test]
async fn malformed_json_rejected_with_400() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender.clone(), no_auth_config());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .body(Body::from("not json {{{"))
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(sender.call_count(), 0);
}

#[tokio::test]
async fn unknown_path_is_404() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender, no_auth_config());
    let request = Request::builder()
        .method("POST")
        .uri("/v1/embeddings")
        .body(Body::from("{}"))
        .unwrap();
    let response = h.app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_starting_then_ok() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender, no_auth_config());
    h.state.ready.store(false, Ordering::SeqCst);

    let response = h
        .app
        .clone()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["status"], "starting");

    h.state.mark_ready();
    let response = h
        .app
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["scanner_mode"], "full");
    assert_eq!(json["connection_pool_size"], 100);
    assert!(json.get("audit_path").is_none());
}

#[tokio::test]
async fn health_scanner_exposes_calibration() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender, no_auth_config());

    let response = h
        .app
        .oneshot(Request::get("/health/scanner").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["calibration"]["sync_threshold"], 1024);
    assert!(json["entity_set"].as_array().unwrap().len() >= 5);
}

// ---------------------------------------------------------------------------
// Dashboard
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dashboard_rejects_non_loopback_peers() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender, no_auth_config());

    // Rebuild the router with a non-loopback peer address
    let app = build_router(h.state.clone())
        .layer(MockConnectInfo(SocketAddr::from(([10, 1, 2, 3], 44444))));

    let response = app
        .oneshot(
            Request::get("/dashboard/api/counters")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn bootstrap_key_creation_then_requires_auth() {
    let sender = MockSender::json_ok(r#"{"ok":true}"#);
    let h = harness_with(sender, Config::default());

    // First creation: store is empty, unauthenticated POST accepted
    let response = h
        .app
        .clone()
        .oneshot(
            Request::post("/dashboard/api/keys")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"first"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    let plaintext = json["key"].as_str().unwrap().to_string();
    assert!(plaintext.starts_with("ong-"));

    // Second unauthenticated creation: rejected
    let response = h
        .app
        .clone()
        .oneshot(
            Request::post("/dashboard/api/keys")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"name":"second"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Authenticated creation with the bootstrap key succeeds
    let response = h
        .app
        .clone()
        .oneshot(
            Request::post("/dashboard/api/keys")
                .header("content-type", "application/json")
                .header("x-ongarde-key", &plaintext)
                .body(Body::from(r#"{"name":"second"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    // Listing is masked — plaintext recoverable from nowhere
    let response = h
        .app
        .oneshot(
            Request::get("/dashboard/api/keys")
                .header("x-ongarde-key", &plaintext)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(!body.contains(&plaintext));
    assert!(body.contains("ong-..."));
}

#[tokio::test]
async fn dashboard_counters_reflect_traffic() {
    let sender = MockSender::json_ok(r#"{"choices":[{"message":{"content":"ok"}}]}"#);
    let h = harness_with(sender, no_auth_config());

    let _ = h
        .app
        .clone()
        .oneshot(chat_request("hello there"))
        .await
        .unwrap();

    let response = h
        .app
        .oneshot(
            Request::get("/dashboard/api/counters")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["requests_today"], 1);
}
