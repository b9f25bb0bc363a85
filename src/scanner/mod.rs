// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Two-tier content scanner
//
// Fast path: one compiled regex catalog, first match wins, sub-millisecond.
// Slow path: NLP entity recognizers (credit card, SSN, email, phone, crypto),
// gated by a startup-calibrated sync threshold; above it the scan is advisory.
// Streaming: windowed accumulation with overlap carry, fast path only.

pub mod calibration;
pub mod gate;
pub mod nlp;
pub mod regex_engine;
pub mod rules;
pub mod streaming;

use serde::Serialize;

/// Hard input cap for the scan pipeline, in characters. Inputs longer than
/// this are truncated before any pattern is evaluated.
pub const INPUT_HARD_CAP: usize = 8_192;

/// Streaming scan window size, in characters.
pub const WINDOW_SIZE: usize = 512;

/// Overlap carry size: the tail of the previous window prepended to the next
/// scan so matches split across a window boundary are still seen whole.
pub const OVERLAP_SIZE: usize = 128;

/// Generate a fresh scan identifier (ULID — monotonic sortable).
pub fn new_scan_id() -> String {
    ulid::Ulid::new().to_string()
}

// ---------------------------------------------------------------------------
// Scan result types
// ---------------------------------------------------------------------------

/// Risk classification of a matched rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum RiskLevel {
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "CRITICAL")]
    Critical,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "LOW",
            RiskLevel::Medium => "MEDIUM",
            RiskLevel::High => "HIGH",
            RiskLevel::Critical => "CRITICAL",
        }
    }
}

/// Scan decision. `Error` is indistinguishable from `Block` to every
/// consumer — `is_block()` is the only question callers may ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Pass,
    Block,
    Error,
}

impl Decision {
    pub fn is_block(&self) -> bool {
        !matches!(self, Decision::Pass)
    }
}

/// Which scanner produced the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOrigin {
    FastPath,
    Nlp,
    Streaming,
    Error,
}

/// Outcome of a scan, shared by the request, buffered-response, and
/// streaming paths.
#[derive(Debug, Clone)]
pub struct ScanResult {
    pub decision: Decision,
    pub scan_id: String,
    pub rule_id: Option<String>,
    pub risk_level: Option<RiskLevel>,
    /// Sanitized context around the match. Never contains the raw secret.
    pub redacted_excerpt: Option<String>,
    /// Ready-to-paste allowlist YAML snippet for policy blocks.
    pub suppression_hint: Option<String>,
    pub origin: ScanOrigin,
    /// True when the match was the registered test credential.
    pub test: bool,
    /// Set when an allowlist entry downgraded the block to a pass.
    pub suppressed_by_allowlist: bool,
    /// Approximate tokens forwarded before a streaming abort.
    pub tokens_delivered: Option<u64>,
}

impl ScanResult {
    pub fn pass(scan_id: &str, origin: ScanOrigin) -> Self {
        Self {
            decision: Decision::Pass,
            scan_id: scan_id.to_string(),
            rule_id: None,
            risk_level: None,
            redacted_excerpt: None,
            suppression_hint: None,
            origin,
            test: false,
            suppressed_by_allowlist: false,
            tokens_delivered: None,
        }
    }

    /// Synthetic fail-safe block for scanner failures. Carries no excerpt and
    /// no suppression hint — system failures are not suppressible.
    pub fn scanner_error(scan_id: &str, rule_id: &str) -> Self {
        Self {
            decision: Decision::Error,
            scan_id: scan_id.to_string(),
            rule_id: Some(rule_id.to_string()),
            risk_level: Some(RiskLevel::Critical),
            redacted_excerpt: None,
            suppression_hint: None,
            origin: ScanOrigin::Error,
            test: false,
            suppressed_by_allowlist: false,
            tokens_delivered: None,
        }
    }
}

/// Rule ids reserved for scanner failures. Never suppressible.
pub const SCANNER_ERROR: &str = "SCANNER_ERROR";
pub const SCANNER_TIMEOUT: &str = "SCANNER_TIMEOUT";
