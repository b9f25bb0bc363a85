// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Upstream transport seam. Handlers depend on the trait; the reqwest
// implementation is injected at startup, mocks in tests.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures_util::stream::Stream;
use futures_util::TryStreamExt;

/// Pool size, matched to the listener's concurrency limit.
pub const POOL_MAX_CONNECTIONS: usize = 100;

/// Total per-request upstream timeout.
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(30);

const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub enum UpstreamBody {
    Full(Bytes),
    Stream(Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>),
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream request failed: {0}")]
    Transport(String),
    #[error("upstream request timed out: {0}")]
    Timeout(String),
}

/// Sends HTTP requests to the configured LLM provider.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}

pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(POOL_MAX_CONNECTIONS)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .timeout(UPSTREAM_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { client }
    }
}

impl Default for ReqwestSender {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn send(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError> {
        let resp = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    UpstreamError::Timeout(e.to_string())
                } else {
                    UpstreamError::Transport(e.to_string())
                }
            })?;

        let status = resp.status();
        let headers = resp.headers().clone();

        // Always hand back a stream; the proxy decides whether to buffer.
        let stream = resp
            .bytes_stream()
            .map_err(|e| UpstreamError::Transport(e.to_string()));
        Ok(UpstreamResponse {
            status,
            headers,
            body: UpstreamBody::Stream(Box::pin(stream)),
        })
    }
}
