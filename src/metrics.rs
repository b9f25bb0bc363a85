// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Rolling counters
//
// Lock-free on the hot path: plain atomics for counts, a CAS loop over f64
// bits for the EWMA latencies. "Today" counters reset lazily when the first
// event of a new UTC day arrives.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Datelike;
use serde::Serialize;

use crate::scanner::RiskLevel;

/// EWMA smoothing factor.
const EWMA_ALPHA: f64 = 0.2;

#[derive(Default)]
pub struct Metrics {
    day: AtomicU64,
    requests_total: AtomicU64,
    requests_today: AtomicU64,
    blocks_total: AtomicU64,
    blocks_today: AtomicU64,
    blocks_low: AtomicU64,
    blocks_medium: AtomicU64,
    blocks_high: AtomicU64,
    blocks_critical: AtomicU64,
    /// EWMA of sync scan latency, stored as f64 bits.
    ewma_scan_ms: AtomicU64,
    /// EWMA of streaming window scan latency, stored as f64 bits.
    ewma_window_ms: AtomicU64,
    window_scans: AtomicU64,
    streaming_active: AtomicU64,
    audit_queue_depth: AtomicU64,
    audit_dropped: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct CountersSnapshot {
    pub requests_today: u64,
    pub requests_all_time: u64,
    pub blocks_today: u64,
    pub blocks_all_time: u64,
    pub blocks_by_risk: BlocksByRisk,
    pub avg_scan_ms: f64,
    pub queue_depth: u64,
    pub audit_events_dropped: u64,
}

#[derive(Debug, Serialize)]
pub struct BlocksByRisk {
    pub low: u64,
    pub medium: u64,
    pub high: u64,
    pub critical: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.roll_day();
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        self.requests_today.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a block. Test-credential matches are audited but never counted.
    pub fn record_block(&self, risk: Option<RiskLevel>, test: bool) {
        if test {
            return;
        }
        self.roll_day();
        self.blocks_total.fetch_add(1, Ordering::Relaxed);
        self.blocks_today.fetch_add(1, Ordering::Relaxed);
        let counter = match risk {
            Some(RiskLevel::Low) => &self.blocks_low,
            Some(RiskLevel::Medium) => &self.blocks_medium,
            Some(RiskLevel::High) => &self.blocks_high,
            Some(RiskLevel::Critical) | None => &self.blocks_critical,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scan_latency_ms(&self, ms: f64) {
        update_ewma(&self.ewma_scan_ms, ms);
    }

    pub fn record_window_scan_ms(&self, ms: f64) {
        self.window_scans.fetch_add(1, Ordering::Relaxed);
        update_ewma(&self.ewma_window_ms, ms);
    }

    pub fn stream_opened(&self) {
        self.streaming_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        let _ = self
            .streaming_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn set_audit_queue_depth(&self, depth: u64) {
        self.audit_queue_depth.store(depth, Ordering::Relaxed);
    }

    pub fn record_audit_drop(&self) {
        self.audit_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn avg_scan_ms(&self) -> f64 {
        f64::from_bits(self.ewma_scan_ms.load(Ordering::Relaxed))
    }

    pub fn window_scan_avg_ms(&self) -> f64 {
        f64::from_bits(self.ewma_window_ms.load(Ordering::Relaxed))
    }

    pub fn window_scan_count(&self) -> u64 {
        self.window_scans.load(Ordering::Relaxed)
    }

    pub fn streaming_active(&self) -> u64 {
        self.streaming_active.load(Ordering::Relaxed)
    }

    pub fn queue_depth(&self) -> u64 {
        self.audit_queue_depth.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            requests_today: self.requests_today.load(Ordering::Relaxed),
            requests_all_time: self.requests_total.load(Ordering::Relaxed),
            blocks_today: self.blocks_today.load(Ordering::Relaxed),
            blocks_all_time: self.blocks_total.load(Ordering::Relaxed),
            blocks_by_risk: BlocksByRisk {
                low: self.blocks_low.load(Ordering::Relaxed),
                medium: self.blocks_medium.load(Ordering::Relaxed),
                high: self.blocks_high.load(Ordering::Relaxed),
                critical: self.blocks_critical.load(Ordering::Relaxed),
            },
            avg_scan_ms: self.avg_scan_ms(),
            queue_depth: self.queue_depth(),
            audit_events_dropped: self.audit_dropped.load(Ordering::Relaxed),
        }
    }

    fn roll_day(&self) {
        let today = current_day();
        let seen = self.day.swap(today, Ordering::Relaxed);
        if seen != today && seen != 0 {
            self.requests_today.store(0, Ordering::Relaxed);
            self.blocks_today.store(0, Ordering::Relaxed);
        }
    }
}

fn current_day() -> u64 {
    chrono::Utc::now().num_days_from_ce() as u64
}

fn update_ewma(cell: &AtomicU64, sample: f64) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let prev = f64::from_bits(current);
        let next = if prev == 0.0 {
            sample
        } else {
            EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * prev
        };
        match cell.compare_exchange_weak(
            current,
            next.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}
