// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Upstream URL validation — runs once at config load, never per-request.
//
// Rejects upstream base URLs whose host is a literal IP in a private,
// link-local, or cloud-metadata range. Loopback is explicitly permitted so
// local LLM runtimes (Ollama on 127.0.0.1) keep working.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::error::ConfigError;

/// Validate an upstream base URL against SSRF targets.
///
/// Accepts `http://` and `https://` URLs. Hostnames are not resolved — only
/// literal IPs are range-checked. `localhost`, `127.0.0.1`, and `::1` pass.
pub fn validate_upstream_url(url: &str) -> Result<(), ConfigError> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .ok_or_else(|| {
            ConfigError::Validation(format!(
                "upstream URL must start with http:// or https://: \"{url}\""
            ))
        })?;

    let host = extract_host(rest);
    if host.is_empty() {
        return Err(ConfigError::Validation(format!(
            "upstream URL has no host: \"{url}\""
        )));
    }

    if host.eq_ignore_ascii_case("localhost") {
        return Ok(());
    }

    if let Ok(ip) = host.parse::<IpAddr>() {
        if is_forbidden_ip(&ip) {
            return Err(ConfigError::ForbiddenUpstream(format!(
                "{host} resolves into a private or metadata IP range"
            )));
        }
    }

    Ok(())
}

/// Pull the host out of the authority section: strip path, port, userinfo,
/// and IPv6 brackets.
fn extract_host(rest: &str) -> &str {
    let authority = rest.split(['/', '?', '#']).next().unwrap_or("");
    let authority = authority.rsplit('@').next().unwrap_or(authority);

    if let Some(stripped) = authority.strip_prefix('[') {
        // Bracketed IPv6 literal: [::1]:8080
        return stripped.split(']').next().unwrap_or("");
    }
    authority.split(':').next().unwrap_or("")
}

fn is_forbidden_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_forbidden_v4(v4),
        IpAddr::V6(v6) => is_forbidden_v6(v6),
    }
}

fn is_forbidden_v4(ip: &Ipv4Addr) -> bool {
    if ip.is_loopback() {
        return false;
    }
    let o = ip.octets();
    // 10/8, 172.16/12, 192.168/16, 169.254/16 (link-local / metadata)
    o[0] == 10
        || (o[0] == 172 && (16..=31).contains(&o[1]))
        || (o[0] == 192 && o[1] == 168)
        || (o[0] == 169 && o[1] == 254)
}

fn is_forbidden_v6(ip: &Ipv6Addr) -> bool {
    if ip.is_loopback() {
        return false;
    }
    // IPv4-mapped addresses take the IPv4 rules
    if let Some(v4) = ip.to_ipv4_mapped() {
        return is_forbidden_v4(&v4);
    }
    let seg = ip.segments();
    // fc00::/7 unique-local, fe80::/10 link-local
    (seg[0] & 0xfe00) == 0xfc00 || (seg[0] & 0xffc0) == 0xfe80
}
