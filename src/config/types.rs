// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

/// Currently supported config file version.
pub const SUPPORTED_CONFIG_VERSION: u32 = 1;

/// Scanner operating mode.
///
/// `Full` runs the regex fast path plus the NLP entity path.
/// `Lite` is regex-only — the NLP component is never initialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerMode {
    Full,
    Lite,
}

impl ScannerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScannerMode::Full => "full",
            ScannerMode::Lite => "lite",
        }
    }
}

/// Upstream LLM provider URL configuration.
///
/// `openai` serves the OpenAI-compatible endpoints (/v1/chat/completions);
/// `anthropic` serves the Anthropic Messages API (/v1/messages). `custom`
/// overrides the OpenAI target for local runtimes such as Ollama.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub openai: String,
    pub anthropic: String,
    pub custom: Option<String>,
    /// Provider credentials injected on dispatch. When unset, a non-OnGarde
    /// Authorization header from the client passes through unchanged.
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            openai: "https://api.openai.com".to_string(),
            anthropic: "https://api.anthropic.com".to_string(),
            custom: None,
            openai_api_key: None,
            anthropic_api_key: None,
        }
    }
}

/// Proxy binding configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4242,
        }
    }
}

/// Scanner subsystem configuration.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub mode: ScannerMode,
    pub entity_set: Vec<String>,
    /// Content length threshold for the synchronous NLP gate. When set in the
    /// file it overrides the startup calibration.
    pub sync_threshold: Option<usize>,
    /// Hard truncation cap applied to text before any scan.
    pub input_hard_cap: usize,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            mode: ScannerMode::Full,
            entity_set: default_entity_set(),
            sync_threshold: None,
            input_hard_cap: crate::scanner::INPUT_HARD_CAP,
        }
    }
}

pub fn default_entity_set() -> Vec<String> {
    ["CREDIT_CARD", "CRYPTO", "EMAIL_ADDRESS", "PHONE_NUMBER", "US_SSN"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Audit backend configuration.
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub retention_days: u32,
    pub path: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            retention_days: 90,
            path: "~/.ongarde/audit.db".to_string(),
        }
    }
}

/// Root configuration, loaded once at startup and shared read-only.
///
/// All fields have safe defaults — OnGarde can start without a config file.
#[derive(Debug, Clone)]
pub struct Config {
    pub upstream: UpstreamConfig,
    pub proxy: ProxyConfig,
    pub scanner: ScannerConfig,
    pub audit: AuditConfig,
    /// Reserved. Emits a warning at startup when true.
    pub strict_mode: bool,
    /// Whether client authentication is enforced (ONGARDE_AUTH_REQUIRED).
    pub auth_required: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream: UpstreamConfig::default(),
            proxy: ProxyConfig::default(),
            scanner: ScannerConfig::default(),
            audit: AuditConfig::default(),
            strict_mode: false,
            auth_required: true,
        }
    }
}
