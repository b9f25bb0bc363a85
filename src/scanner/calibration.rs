// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Startup calibration for the NLP sync gate
//
// Probes actual NLP scan latency on the current host before the proxy starts
// accepting traffic, and derives the sync threshold and timeout from the
// measurements instead of assuming reference hardware. Calibration failure
// falls back to conservative defaults; it never aborts startup.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use super::nlp::NlpScanner;

/// Input sizes probed during calibration (chars), smallest first. The middle
/// size doubles as the default sync threshold.
pub const CALIBRATION_SIZES: [usize; 3] = [128, 512, 1024];

/// Iterations per size. 5 x 3 sizes completes well under a second.
pub const CALIBRATION_ITERATIONS: usize = 5;

/// p99 latency target (ms) for sync eligibility. Leaves headroom inside the
/// 50 ms total added-latency budget.
pub const TARGET_LATENCY_MS: f64 = 30.0;

/// Sync threshold used when calibration cannot run.
pub const DEFAULT_SYNC_THRESHOLD: usize = 512;

const TIMEOUT_MULTIPLIER: f64 = 1.5;
const TIMEOUT_MIN: Duration = Duration::from_millis(25);
const TIMEOUT_MAX: Duration = Duration::from_millis(60);

/// Hardware tier classification, surfaced in /health/scanner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Fast,
    Standard,
    Slow,
    Minimal,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Standard => "standard",
            Tier::Slow => "slow",
            Tier::Minimal => "minimal",
        }
    }
}

/// Result of startup calibration. Immutable once published.
#[derive(Debug, Clone)]
pub struct CalibrationResult {
    /// Content length at or below which the NLP path runs synchronously.
    /// Zero disables the sync gate entirely (all NLP becomes advisory).
    pub sync_threshold: usize,
    pub timeout: Duration,
    pub tier: Tier,
    /// size -> measured p99 ms.
    pub measurements: BTreeMap<usize, f64>,
    pub calibration_ok: bool,
    pub fallback_reason: Option<String>,
}

impl CalibrationResult {
    /// Conservative values used when calibration fails or lite mode skips it.
    pub fn conservative_fallback(reason: &str) -> Self {
        Self {
            sync_threshold: DEFAULT_SYNC_THRESHOLD,
            timeout: TIMEOUT_MAX,
            tier: Tier::Minimal,
            measurements: BTreeMap::new(),
            calibration_ok: false,
            fallback_reason: Some(reason.to_string()),
        }
    }
}

/// Derive thresholds from measurements. Pure function, separated from the
/// timing loop so it can be unit-tested without a scanner.
pub fn derive_thresholds(measurements: &BTreeMap<usize, f64>) -> CalibrationResult {
    // Largest size whose p99 stays under the target
    let mut sync_threshold = 0usize;
    for size in CALIBRATION_SIZES {
        if let Some(&p99) = measurements.get(&size) {
            if p99 <= TARGET_LATENCY_MS {
                sync_threshold = size;
            }
        }
    }

    let reference_p99 = if sync_threshold > 0 {
        measurements.get(&sync_threshold).copied()
    } else {
        measurements.get(&CALIBRATION_SIZES[0]).copied()
    };

    let timeout = match reference_p99 {
        Some(p99) => {
            let t = Duration::from_secs_f64(p99 / 1000.0 * TIMEOUT_MULTIPLIER);
            t.clamp(TIMEOUT_MIN, TIMEOUT_MAX)
        }
        None => TIMEOUT_MAX,
    };

    let largest = *CALIBRATION_SIZES.last().unwrap();
    let p99_largest = measurements.get(&largest).copied();
    let tier = if sync_threshold == 0 {
        Tier::Minimal
    } else {
        match p99_largest {
            Some(p) if p <= 20.0 => Tier::Fast,
            Some(p) if p <= TARGET_LATENCY_MS => Tier::Standard,
            Some(_) => Tier::Slow,
            None => {
                if sync_threshold < largest {
                    Tier::Slow
                } else {
                    Tier::Standard
                }
            }
        }
    };

    CalibrationResult {
        sync_threshold,
        timeout,
        tier,
        measurements: measurements.clone(),
        calibration_ok: true,
        fallback_reason: None,
    }
}

/// Run the calibration probes against a live scanner.
pub fn run_calibration(scanner: &NlpScanner) -> CalibrationResult {
    let mut measurements = BTreeMap::new();

    tracing::info!(
        sizes = ?CALIBRATION_SIZES,
        iterations = CALIBRATION_ITERATIONS,
        target_ms = TARGET_LATENCY_MS,
        "nlp calibration starting"
    );

    for size in CALIBRATION_SIZES {
        let text = make_calibration_text(size);
        let mut latencies: Vec<f64> = Vec::with_capacity(CALIBRATION_ITERATIONS);

        for _ in 0..CALIBRATION_ITERATIONS {
            let t0 = Instant::now();
            let _ = scanner.scan(&text);
            latencies.push(t0.elapsed().as_secs_f64() * 1000.0);
        }

        // Max as a conservative p99 estimate for small N
        let p99 = latencies.iter().cloned().fold(0.0f64, f64::max);
        measurements.insert(size, p99);
    }

    let result = derive_thresholds(&measurements);
    tracing::info!(
        tier = result.tier.as_str(),
        sync_threshold = result.sync_threshold,
        timeout_ms = result.timeout.as_millis() as u64,
        "nlp calibration complete"
    );
    result
}

/// Clean prose of exactly `size` chars. No PII — probes raw recognizer cost.
fn make_calibration_text(size: usize) -> String {
    const TEMPLATE: &str = "The quick brown fox jumps over the lazy dog. \
        Alice went to the market to buy fresh vegetables and fruits. \
        Bob called his colleague to discuss the quarterly report. \
        The conference is scheduled for next Tuesday in the main meeting room. \
        Please review the attached document and provide your feedback by Friday. ";
    TEMPLATE.chars().cycle().take(size).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_entity_set;

    fn measurements(v128: f64, v512: f64, v1024: f64) -> BTreeMap<usize, f64> {
        BTreeMap::from([(128, v128), (512, v512), (1024, v1024)])
    }

    #[test]
    fn fast_host_gets_largest_threshold() {
        let r = derive_thresholds(&measurements(1.0, 3.0, 8.0));
        assert_eq!(r.sync_threshold, 1024);
        assert_eq!(r.tier, Tier::Fast);
        assert_eq!(r.timeout, TIMEOUT_MIN);
    }

    #[test]
    fn standard_host_keeps_budget() {
        let r = derive_thresholds(&measurements(5.0, 12.0, 28.0));
        assert_eq!(r.sync_threshold, 1024);
        assert_eq!(r.tier, Tier::Standard);
    }

    #[test]
    fn slow_host_reduces_threshold() {
        let r = derive_thresholds(&measurements(8.0, 22.0, 45.0));
        assert_eq!(r.sync_threshold, 512);
        assert_eq!(r.tier, Tier::Slow);
    }

    #[test]
    fn severely_constrained_host_disables_sync_gate() {
        let r = derive_thresholds(&measurements(55.0, 120.0, 300.0));
        assert_eq!(r.sync_threshold, 0);
        assert_eq!(r.tier, Tier::Minimal);
    }

    #[test]
    fn timeout_clamped_to_bounds() {
        let r = derive_thresholds(&measurements(0.1, 0.2, 0.3));
        assert_eq!(r.timeout, TIMEOUT_MIN);

        let r = derive_thresholds(&measurements(8.0, 22.0, 55.0));
        assert!(r.timeout <= TIMEOUT_MAX);
    }

    #[test]
    fn fallback_is_conservative() {
        let r = CalibrationResult::conservative_fallback("scanner unavailable");
        assert_eq!(r.sync_threshold, DEFAULT_SYNC_THRESHOLD);
        assert_eq!(r.timeout, TIMEOUT_MAX);
        assert!(!r.calibration_ok);
    }

    #[test]
    fn calibration_text_has_exact_size_and_no_pii() {
        let text = make_calibration_text(512);
        assert_eq!(text.chars().count(), 512);
        let scanner = NlpScanner::new(&default_entity_set());
        assert!(scanner.scan(&text).is_empty());
    }

    #[test]
    fn repeated_runs_agree_within_one_step() {
        // Quantization: the threshold is always one of the probe sizes (or 0),
        // so two runs on the same host differ by at most one step.
        let scanner = NlpScanner::new(&default_entity_set());
        let a = run_calibration(&scanner);
        let b = run_calibration(&scanner);

        let step_of = |t: usize| {
            CALIBRATION_SIZES
                .iter()
                .position(|&s| s == t)
                .map(|p| p as i64 + 1)
                .unwrap_or(0)
        };
        assert!((step_of(a.sync_threshold) - step_of(b.sync_threshold)).abs() <= 1);
    }
}
