// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Authentication and API key management.

mod keys;
mod limiter;

pub use keys::{default_keys_path, ApiKeyRecord, KeyStore, KeyStoreError, KEY_PREFIX};
pub use limiter::{RateLimiter, KEY_MANAGEMENT_LIMIT, KEY_MANAGEMENT_WINDOW};

use axum::http::HeaderMap;

/// Extract the OnGarde key from request headers. `X-OnGarde-Key` takes
/// precedence; `Authorization: Bearer ong-…` is the fallback. Non-OnGarde
/// bearer tokens (provider keys) are never consumed here.
pub fn extract_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get("x-ongarde-key").and_then(|v| v.to_str().ok()) {
        return Some(value.trim().to_string());
    }
    let auth = headers.get("authorization")?.to_str().ok()?;
    let token = auth.trim().strip_prefix("Bearer ").or_else(|| auth.trim().strip_prefix("bearer "))?;
    let token = token.trim();
    if token.starts_with(KEY_PREFIX) {
        return Some(token.to_string());
    }
    None
}
