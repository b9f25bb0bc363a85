// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Header fan-out between client, proxy, and upstream.
//
// Inbound: the OnGarde key never leaves the proxy; hop-by-hop headers are
// stripped; a scan-id header is injected so upstream logs can be correlated.
// When provider credentials are configured they replace whatever
// authorization the client sent.

use axum::http::header::{HeaderMap, HeaderName, HeaderValue};

use crate::config::Config;
use crate::proxy::Provider;

/// RFC 7230 hop-by-hop headers, never forwarded in either direction.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

pub const SCAN_ID_HEADER: &str = "x-ongarde-scan-id";
pub const BLOCK_HEADER: &str = "x-ongarde-block";
const ONGARDE_KEY_HEADER: &str = "x-ongarde-key";

/// Build the header set for the upstream request.
pub fn build_upstream_headers(
    client_headers: &HeaderMap,
    scan_id: &str,
    provider: Provider,
    config: &Config,
) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(client_headers.len() + 2);

    for (name, value) in client_headers {
        let lname = name.as_str();
        if HOP_BY_HOP.contains(&lname)
            || lname == ONGARDE_KEY_HEADER
            || lname == "host"
            || lname == "content-length"
        {
            continue;
        }
        // An OnGarde bearer token is proxy auth, not provider auth
        if lname == "authorization" && is_ongarde_bearer(value) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    // Configured provider credentials win over whatever the client sent
    match provider {
        Provider::OpenAi => {
            if let Some(key) = &config.upstream.openai_api_key {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {key}")) {
                    headers.insert("authorization", value);
                }
            }
        }
        Provider::Anthropic => {
            if let Some(key) = &config.upstream.anthropic_api_key {
                if let Ok(value) = HeaderValue::from_str(key) {
                    headers.insert("x-api-key", value);
                    headers.remove("authorization");
                }
            }
        }
    }

    if let Ok(value) = HeaderValue::from_str(scan_id) {
        headers.insert(HeaderName::from_static(SCAN_ID_HEADER), value);
    }
    headers
}

/// Strip hop-by-hop headers from the upstream response before forwarding.
pub fn build_client_response_headers(upstream_headers: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(upstream_headers.len());
    for (name, value) in upstream_headers {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

fn is_ongarde_bearer(value: &HeaderValue) -> bool {
    value
        .to_str()
        .map(|v| {
            let v = v.trim();
            v.strip_prefix("Bearer ")
                .or_else(|| v.strip_prefix("bearer "))
                .map(|t| t.trim().starts_with(crate::auth::KEY_PREFIX))
                .unwrap_or(false)
        })
        .unwrap_or(false)
}
