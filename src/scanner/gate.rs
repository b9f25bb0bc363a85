// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Scan gate — the only entry point for request and buffered-response scans.
//
// Invariant: always returns a ScanResult, never panics out, never leaks a
// scanner failure as anything but BLOCK. Timeouts map to SCANNER_TIMEOUT and
// every other failure to SCANNER_ERROR; to the client the two are ordinary
// blocks.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::allowlist::{apply_allowlist, Allowlist};
use crate::audit::{AuditEvent, AuditHandle, Direction};
use crate::config::{Config, ScannerMode};
use crate::metrics::Metrics;

use super::calibration::CalibrationResult;
use super::nlp::NlpScanner;
use super::regex_engine::{apply_input_cap, fast_path_scan};
use super::{ScanOrigin, ScanResult, SCANNER_ERROR, SCANNER_TIMEOUT};

/// Advisory scans get a generous multiple of the sync timeout — they never
/// gate a response.
const ADVISORY_TIMEOUT_MULTIPLIER: u32 = 3;

/// Total added latency budget; sync scans past this log a warning.
const LATENCY_BUDGET: Duration = Duration::from_millis(50);

/// Per-scan context threaded into audit events.
#[derive(Clone)]
pub struct ScanContext {
    pub direction: Direction,
    pub key_id: String,
    pub upstream: Option<String>,
}

pub struct ScanGate {
    mode: ScannerMode,
    nlp: Option<Arc<NlpScanner>>,
    sync_threshold: usize,
    nlp_timeout: Duration,
    input_hard_cap: usize,
    allowlist: Arc<Allowlist>,
    metrics: Arc<Metrics>,
    audit: AuditHandle,
}

impl ScanGate {
    pub fn new(
        config: &Config,
        nlp: Option<Arc<NlpScanner>>,
        calibration: &CalibrationResult,
        allowlist: Arc<Allowlist>,
        metrics: Arc<Metrics>,
        audit: AuditHandle,
    ) -> Self {
        // An explicit file value wins over the calibrated threshold
        let sync_threshold = config
            .scanner
            .sync_threshold
            .unwrap_or(calibration.sync_threshold);
        Self {
            mode: config.scanner.mode,
            nlp,
            sync_threshold,
            nlp_timeout: calibration.timeout,
            input_hard_cap: config.scanner.input_hard_cap,
            allowlist,
            metrics,
            audit,
        }
    }

    pub fn sync_threshold(&self) -> usize {
        self.sync_threshold
    }

    pub fn nlp_timeout(&self) -> Duration {
        self.nlp_timeout
    }

    pub fn mode(&self) -> ScannerMode {
        self.mode
    }

    /// Scan a piece of extracted text. Fast path always runs; the NLP path
    /// runs synchronously iff the text fits under the calibrated threshold,
    /// otherwise it is dispatched as an advisory background task.
    pub async fn scan_or_block(&self, text: &str, scan_id: &str, ctx: ScanContext) -> ScanResult {
        let t0 = Instant::now();
        let result = self.scan_inner(text, scan_id, &ctx).await;

        let elapsed = t0.elapsed();
        self.metrics
            .record_scan_latency_ms(elapsed.as_secs_f64() * 1000.0);
        if elapsed > LATENCY_BUDGET {
            tracing::warn!(
                scan_id = %scan_id,
                elapsed_ms = elapsed.as_millis() as u64,
                "scan exceeded latency budget"
            );
        }
        result
    }

    async fn scan_inner(&self, text: &str, scan_id: &str, ctx: &ScanContext) -> ScanResult {
        let (capped, truncated) = apply_input_cap(text, self.input_hard_cap);
        if truncated {
            tracing::warn!(
                scan_id = %scan_id,
                original_length = text.chars().count(),
                cap = self.input_hard_cap,
                "scan input truncated"
            );
        }

        // Fast path. A panic inside the regex engine is a scanner failure,
        // which fails safe.
        let fast = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            fast_path_scan(capped, scan_id)
        })) {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(scan_id = %scan_id, "fast path panicked — blocking");
                return ScanResult::scanner_error(scan_id, SCANNER_ERROR);
            }
        };
        if let Some(block) = fast {
            return apply_allowlist(block, capped, &self.allowlist.snapshot());
        }

        // NLP path (full mode only)
        let Some(nlp) = (self.mode == ScannerMode::Full)
            .then(|| self.nlp.clone())
            .flatten()
        else {
            return ScanResult::pass(scan_id, ScanOrigin::FastPath);
        };

        let char_len = capped.chars().count();
        if self.sync_threshold > 0 && char_len <= self.sync_threshold {
            let owned = capped.to_string();
            let owned_id = scan_id.to_string();
            let scan_task = tokio::task::spawn_blocking(move || nlp.scan_result(&owned, &owned_id));

            let result = match tokio::time::timeout(self.nlp_timeout, scan_task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join_err)) => {
                    tracing::error!(scan_id = %scan_id, error = %join_err,
                        "nlp scan task failed — blocking");
                    return ScanResult::scanner_error(scan_id, SCANNER_ERROR);
                }
                Err(_) => {
                    tracing::error!(
                        scan_id = %scan_id,
                        timeout_ms = self.nlp_timeout.as_millis() as u64,
                        "nlp scan timed out — blocking"
                    );
                    return ScanResult::scanner_error(scan_id, SCANNER_TIMEOUT);
                }
            };
            if result.decision.is_block() {
                return apply_allowlist(result, capped, &self.allowlist.snapshot());
            }
            return ScanResult::pass(scan_id, ScanOrigin::Nlp);
        }

        if char_len > 0 {
            self.spawn_advisory(nlp, capped.to_string(), scan_id.to_string(), ctx.clone());
        }
        ScanResult::pass(scan_id, ScanOrigin::FastPath)
    }

    /// Buffered-response scan: fast path plus a synchronous NLP pass
    /// regardless of content length. No byte of a buffered response reaches
    /// the client before this returns PASS, so the NLP gate is not
    /// threshold-limited here.
    pub async fn scan_buffered_response(&self, text: &str, scan_id: &str) -> ScanResult {
        const RESPONSE_SCAN_TIMEOUT: Duration = Duration::from_secs(1);

        let t0 = Instant::now();
        let (capped, _) = apply_input_cap(text, self.input_hard_cap);

        let fast = match std::panic::catch_unwind(AssertUnwindSafe(|| {
            fast_path_scan(capped, scan_id)
        })) {
            Ok(outcome) => outcome,
            Err(_) => return ScanResult::scanner_error(scan_id, SCANNER_ERROR),
        };
        if let Some(block) = fast {
            self.metrics
                .record_scan_latency_ms(t0.elapsed().as_secs_f64() * 1000.0);
            return apply_allowlist(block, capped, &self.allowlist.snapshot());
        }

        let Some(nlp) = (self.mode == ScannerMode::Full)
            .then(|| self.nlp.clone())
            .flatten()
        else {
            return ScanResult::pass(scan_id, ScanOrigin::FastPath);
        };

        let owned = capped.to_string();
        let owned_id = scan_id.to_string();
        let task = tokio::task::spawn_blocking(move || nlp.scan_result(&owned, &owned_id));
        let result = match tokio::time::timeout(RESPONSE_SCAN_TIMEOUT, task).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => return ScanResult::scanner_error(scan_id, SCANNER_ERROR),
            Err(_) => return ScanResult::scanner_error(scan_id, SCANNER_TIMEOUT),
        };
        self.metrics
            .record_scan_latency_ms(t0.elapsed().as_secs_f64() * 1000.0);
        if result.decision.is_block() {
            return apply_allowlist(result, capped, &self.allowlist.snapshot());
        }
        ScanResult::pass(scan_id, ScanOrigin::Nlp)
    }

    /// Background NLP over content that exceeded the sync threshold. Records
    /// an audit event on detection; can never block the request.
    fn spawn_advisory(
        &self,
        nlp: Arc<NlpScanner>,
        text: String,
        scan_id: String,
        ctx: ScanContext,
    ) {
        let audit = self.audit.clone();
        let timeout = self.nlp_timeout * ADVISORY_TIMEOUT_MULTIPLIER;
        tokio::spawn(async move {
            let task = tokio::task::spawn_blocking(move || nlp.scan(&text));
            let entities = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(entities)) => entities,
                Ok(Err(_)) | Err(_) => {
                    tracing::debug!(scan_id = %scan_id, "advisory nlp scan did not complete");
                    return;
                }
            };
            if entities.is_empty() {
                return;
            }

            let types: Vec<String> = entities
                .iter()
                .map(|e| e.entity_type.to_string())
                .collect();
            tracing::info!(scan_id = %scan_id, entities = ?types, "advisory nlp detected pii");

            let mut event = AuditEvent {
                scan_id,
                timestamp: crate::audit::now_rfc3339(),
                action: "ALLOW".to_string(),
                direction: ctx.direction.as_str().to_string(),
                rule_id: Some("NLP_ADVISORY".to_string()),
                risk_level: None,
                redacted_excerpt: None,
                key_id: ctx.key_id,
                upstream: ctx.upstream,
                was_streaming: false,
                tokens_delivered: None,
                test: false,
                suppressed_by_allowlist: false,
                truncated: false,
                original_length: None,
                advisory_entities: None,
            };
            event.advisory_entities = Some(types);
            audit.emit(event);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{start_pipeline, SqliteAuditStore};
    use crate::config::default_entity_set;
    use crate::scanner::calibration::CalibrationResult;
    use crate::scanner::Decision;

    fn test_gate(config: Config, calibration: CalibrationResult) -> (ScanGate, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let audit = start_pipeline(
            Arc::new(SqliteAuditStore::open_in_memory().unwrap()),
            None,
            metrics.clone(),
        );
        let dir = std::env::temp_dir().join("ongarde-gate-test-absent.yaml");
        let allowlist = Allowlist::load(&dir);
        let nlp = Some(Arc::new(NlpScanner::new(&default_entity_set())));
        let gate = ScanGate::new(&config, nlp, &calibration, allowlist, metrics.clone(), audit);
        (gate, metrics)
    }

    fn fast_calibration() -> CalibrationResult {
        let mut measurements = std::collections::BTreeMap::new();
        measurements.insert(128, 1.0);
        measurements.insert(512, 2.0);
        measurements.insert(1024, 4.0);
        crate::scanner::calibration::derive_thresholds(&measurements)
    }

    fn ctx() -> ScanContext {
        ScanContext {
            direction: Direction::Request,
            key_id: "test-key".to_string(),
            upstream: None,
        }
    }

    #[tokio::test]
    async fn credential_blocks_via_fast_path() {
        let (gate, _) = test_gate(Config::default(), fast_calibration());
        let result = gate
            .scan_or_block(
                "here is my key sk-proj-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                "01TEST",
                ctx(),
            )
            .await;
        assert_eq!(result.decision, Decision::Block);
        assert_eq!(result.rule_id.as_deref(), Some("CREDENTIAL_DETECTED"));
        assert_eq!(result.risk_level, Some(crate::scanner::RiskLevel::Critical));
    }

    #[tokio::test]
    async fn short_pii_text_blocks_via_sync_nlp() {
        let (gate, _) = test_gate(Config::default(), fast_calibration());
        // No fast-path pattern fires here (lowercase, no digits in PII shape),
        // but the NLP email recognizer does.
        let result = gate
            .scan_or_block("contact jane at jane/doe at example dot com", "01TEST", ctx())
            .await;
        assert_eq!(result.decision, Decision::Pass);

        let result = gate
            .scan_or_block("card 4111 1111 1111 1111 ok", "01TEST2", ctx())
            .await;
        assert!(result.decision.is_block());
    }

    #[tokio::test]
    async fn long_clean_text_passes_with_advisory_dispatch() {
        let (gate, _) = test_gate(Config::default(), fast_calibration());
        let long: String = "clean words repeated over and over again here "
            .chars()
            .cycle()
            .take(3000)
            .collect();
        let result = gate.scan_or_block(&long, "01TEST", ctx()).await;
        assert_eq!(result.decision, Decision::Pass);
        assert_eq!(gate.sync_threshold(), 1024);
    }

    #[tokio::test]
    async fn lite_mode_never_runs_nlp() {
        let mut config = Config::default();
        config.scanner.mode = ScannerMode::Lite;
        let (gate, _) = test_gate(config, fast_calibration());

        // A separated Luhn-valid card needs the NLP recognizer (the fast-path
        // pattern wants a contiguous digit core); lite mode passes it.
        let result = gate
            .scan_or_block("card 4111 1111 1111 1111 ok", "01TEST", ctx())
            .await;
        assert_eq!(result.decision, Decision::Pass);

        let result = gate
            .scan_or_block("hello world, nothing sensitive", "01TEST2", ctx())
            .await;
        assert_eq!(result.decision, Decision::Pass);
    }

    #[tokio::test]
    async fn test_credential_blocks_with_test_flag() {
        let (gate, metrics) = test_gate(Config::default(), fast_calibration());
        let result = gate
            .scan_or_block("sk-ongarde-test-fake-key-12345", "01TEST", ctx())
            .await;
        assert!(result.decision.is_block());
        assert!(result.test);
        // Counting is the proxy's job; the gate must not have counted either.
        assert_eq!(metrics.snapshot().blocks_all_time, 0);
    }

    #[tokio::test]
    async fn zero_threshold_disables_sync_gate() {
        let mut measurements = std::collections::BTreeMap::new();
        measurements.insert(128, 200.0);
        measurements.insert(512, 400.0);
        measurements.insert(1024, 800.0);
        let calibration = crate::scanner::calibration::derive_thresholds(&measurements);
        assert_eq!(calibration.sync_threshold, 0);

        let (gate, _) = test_gate(Config::default(), calibration);
        // PII that only NLP would catch passes synchronously (advisory only)
        let result = gate
            .scan_or_block("card 4111 1111 1111 1111 ok", "01TEST", ctx())
            .await;
        assert_eq!(result.decision, Decision::Pass);
    }

    #[tokio::test]
    async fn scan_latency_recorded() {
        let (gate, metrics) = test_gate(Config::default(), fast_calibration());
        gate.scan_or_block("hello", "01TEST", ctx()).await;
        assert!(metrics.avg_scan_ms() > 0.0);
    }
}
