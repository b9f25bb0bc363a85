// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Dashboard surface — loopback only.
//
// The middleware compares the immediate peer address to 127.0.0.1/::1 and
// ignores proxy-forwarded headers: an X-Forwarded-For from a remote client
// must not be able to impersonate localhost. Key management is rate-limited
// per source IP. Key creation is unauthenticated only while the store has
// never issued a key (first-run bootstrap).

use std::net::SocketAddr;

use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::auth::extract_key;
use crate::proxy::AppState;

const DASHBOARD_PAGE: &str = include_str!("page.html");

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/dashboard", get(index))
        .route("/dashboard/api/counters", get(counters))
        .route("/dashboard/api/events", get(events))
        .route("/dashboard/api/keys", post(create_key).get(list_keys))
        .route("/dashboard/api/keys/:id", delete(revoke_key))
        .layer(middleware::from_fn(require_loopback))
}

/// Reject any dashboard request whose peer address is not loopback.
/// Forwarded headers are deliberately ignored here.
async fn require_loopback(
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !addr.ip().is_loopback() {
        tracing::warn!(peer = %addr, path = %request.uri().path(),
            "dashboard access denied: non-loopback origin");
        let body = serde_json::json!({
            "error": {
                "message": "Dashboard access is restricted to localhost",
                "code": "forbidden",
            }
        });
        return (StatusCode::FORBIDDEN, Json(body)).into_response();
    }
    next.run(request).await
}

async fn index() -> Html<&'static str> {
    Html(DASHBOARD_PAGE)
}

async fn counters(State(state): State<AppState>) -> Response {
    Json(state.metrics.snapshot()).into_response()
}

#[derive(Deserialize)]
struct EventsQuery {
    limit: Option<usize>,
}

async fn events(State(state): State<AppState>, Query(query): Query<EventsQuery>) -> Response {
    let limit = query.limit.unwrap_or(50).min(500);
    let store = state.audit_store.clone();
    let events = tokio::task::spawn_blocking(move || store.query_recent(limit)).await;

    match events {
        Ok(Ok(events)) => Json(serde_json::json!({ "events": events })).into_response(),
        _ => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({
                "error": { "message": "Audit store unavailable", "code": "audit_error" }
            })),
        )
            .into_response(),
    }
}

#[derive(Deserialize)]
struct CreateKeyRequest {
    name: Option<String>,
}

async fn create_key(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    body: Option<Json<CreateKeyRequest>>,
) -> Response {
    if !state.limiter.check(addr.ip()) {
        return rate_limited();
    }

    // Bootstrap: the very first key may be created unauthenticated.
    // Afterwards key creation requires a valid existing key.
    let store = state.keys.clone();
    let bootstrap = tokio::task::spawn_blocking(move || store.count() == 0)
        .await
        .unwrap_or(false);
    if !bootstrap {
        if let Err(response) = require_valid_key(&state, &headers).await {
            return response;
        }
    }

    let name = body
        .and_then(|Json(b)| b.name)
        .unwrap_or_else(|| "default".to_string());

    let store = state.keys.clone();
    let created = tokio::task::spawn_blocking(move || store.create(&name)).await;

    match created {
        Ok(Ok((record, plaintext))) => {
            // The plaintext appears in this response and nowhere else
            let body = serde_json::json!({
                "key": plaintext,
                "id": record.id,
                "name": record.name,
                "created_at": record.created_at,
            });
            (StatusCode::CREATED, Json(body)).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "key creation failed");
            internal_error()
        }
        Err(_) => internal_error(),
    }
}

async fn list_keys(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
) -> Response {
    if !state.limiter.check(addr.ip()) {
        return rate_limited();
    }
    if let Err(response) = require_valid_key(&state, &headers).await {
        return response;
    }

    let store = state.keys.clone();
    match tokio::task::spawn_blocking(move || store.list()).await {
        Ok(Ok(keys)) => Json(serde_json::json!({ "keys": keys })).into_response(),
        _ => internal_error(),
    }
}

async fn revoke_key(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: axum::http::HeaderMap,
    Path(id): Path<String>,
) -> Response {
    if !state.limiter.check(addr.ip()) {
        return rate_limited();
    }
    if let Err(response) = require_valid_key(&state, &headers).await {
        return response;
    }

    let store = state.keys.clone();
    let id_for_blocking = id.clone();
    match tokio::task::spawn_blocking(move || store.revoke(&id_for_blocking)).await {
        Ok(Ok(())) => Json(serde_json::json!({ "revoked": id })).into_response(),
        Ok(Err(crate::auth::KeyStoreError::NotFound)) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": { "message": "Key not found", "code": "not_found" }
            })),
        )
            .into_response(),
        _ => internal_error(),
    }
}

/// Key-management auth: same key extraction as the proxy path. Bypassed when
/// auth is disabled for the whole proxy.
async fn require_valid_key(
    state: &AppState,
    headers: &axum::http::HeaderMap,
) -> Result<(), Response> {
    if !state.config.auth_required {
        return Ok(());
    }
    let Some(key) = extract_key(headers) else {
        return Err(unauthorized());
    };
    let keys = state.keys.clone();
    let verified = tokio::task::spawn_blocking(move || keys.verify(&key))
        .await
        .ok()
        .flatten();
    if verified.is_none() {
        return Err(unauthorized());
    }
    Ok(())
}

fn unauthorized() -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(serde_json::json!({
            "error": { "message": "Missing or invalid OnGarde API key", "code": "unauthorized" }
        })),
    )
        .into_response()
}

fn rate_limited() -> Response {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "error": { "message": "Too many key management requests", "code": "rate_limited" }
        })),
    )
        .into_response()
}

fn internal_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "error": { "message": "Internal error", "code": "internal_error" }
        })),
    )
        .into_response()
}
