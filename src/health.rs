// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Health endpoints
//
// /health answers 503 with status "starting" until the scanner is ready
// (rules compiled, NLP built in full mode, calibration complete), then 200
// with the summary body. /health/scanner adds the calibration detail and
// streaming window metrics. Neither body ever contains filesystem paths.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};

use crate::proxy::{AppState, MAX_CONCURRENT_REQUESTS};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/scanner", get(health_scanner))
}

/// Schema docs, mounted only when the DEBUG env flag is set.
pub fn docs_router() -> Router<AppState> {
    Router::new().route("/docs", get(docs))
}

async fn health(State(state): State<AppState>) -> Response {
    if !state.is_ready() {
        return starting_response();
    }

    let body = serde_json::json!({
        "status": "ok",
        "proxy": "running",
        "scanner": "healthy",
        "scanner_mode": state.config.scanner.mode.as_str(),
        "connection_pool_size": MAX_CONCURRENT_REQUESTS,
        "avg_scan_ms": round2(state.metrics.avg_scan_ms()),
        "queue_depth": state.metrics.queue_depth(),
        "deployment_mode": "self-hosted",
    });
    Json(body).into_response()
}

async fn health_scanner(State(state): State<AppState>) -> Response {
    if !state.is_ready() {
        return starting_response();
    }

    let calibration = &state.calibration;
    let measurements: serde_json::Map<String, serde_json::Value> = calibration
        .measurements
        .iter()
        .map(|(size, p99)| (size.to_string(), serde_json::json!(round2(*p99))))
        .collect();

    let body = serde_json::json!({
        "scanner": "healthy",
        "scanner_mode": state.config.scanner.mode.as_str(),
        "entity_set": state.config.scanner.entity_set,
        "avg_scan_ms": round2(state.metrics.avg_scan_ms()),
        "queue_depth": state.metrics.queue_depth(),
        "sync_threshold": state.gate.sync_threshold(),
        "calibration": {
            "tier": calibration.tier.as_str(),
            "sync_threshold": calibration.sync_threshold,
            "timeout_ms": calibration.timeout.as_millis() as u64,
            "measured_p99_ms": measurements,
            "calibration_ok": calibration.calibration_ok,
            "fallback_reason": calibration.fallback_reason,
        },
        "streaming_active": state.metrics.streaming_active(),
        "window_scan_avg_ms": round2(state.metrics.window_scan_avg_ms()),
        "window_scan_count": state.metrics.window_scan_count(),
    });
    Json(body).into_response()
}

async fn docs(State(state): State<AppState>) -> Response {
    let body = serde_json::json!({
        "endpoints": [
            "POST /v1/chat/completions",
            "POST /v1/messages",
            "GET /health",
            "GET /health/scanner",
            "GET /dashboard/api/counters",
            "GET /dashboard/api/events",
            "POST /dashboard/api/keys",
            "GET /dashboard/api/keys",
            "DELETE /dashboard/api/keys/:id",
        ],
        "scanner_mode": state.config.scanner.mode.as_str(),
    });
    Json(body).into_response()
}

fn starting_response() -> Response {
    let body = serde_json::json!({
        "status": "starting",
        "scanner": "initializing",
        "message": "OnGarde is starting up. Scanner warming up...",
    });
    (StatusCode::SERVICE_UNAVAILABLE, Json(body)).into_response()
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
