// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Raw YAML deserialization types (internal)
// These are separate from the public Config structs because:
// 1. We validate version / mode values between raw and public
// 2. Env var overrides are applied after the raw parse
// 3. Keeps the public API clean

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    pub version: Option<u32>,
    pub upstream: Option<RawUpstreamConfig>,
    pub proxy: Option<RawProxyConfig>,
    pub scanner: Option<RawScannerConfig>,
    pub audit: Option<RawAuditConfig>,
    #[serde(default)]
    pub strict_mode: bool,
}

#[derive(Debug, Deserialize)]
pub struct RawUpstreamConfig {
    pub openai: Option<String>,
    pub anthropic: Option<String>,
    /// Optional custom upstream for Ollama or other local runtimes.
    pub custom: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RawProxyConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Deserialize)]
pub struct RawScannerConfig {
    pub mode: Option<String>,
    pub entity_set: Option<Vec<String>>,
    pub sync_threshold: Option<usize>,
    pub input_hard_cap: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct RawAuditConfig {
    pub retention_days: Option<u32>,
    pub path: Option<String>,
}
