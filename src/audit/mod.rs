// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Append-only audit pipeline
//
// Events flow through a bounded channel drained by a single writer into the
// embedded SQL store. Emission from the request path is `try_send`: a full
// channel drops the event and bumps a counter, it never blocks a request.
// A secondary sink may ride along; its failures never affect the primary.

mod sqlite;

pub use sqlite::{AuditStoreError, SqliteAuditStore};

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use crate::metrics::Metrics;
use crate::scanner::ScanResult;

/// Audit channel capacity.
pub const AUDIT_CHANNEL_CAPACITY: usize = 1024;

/// Max events written per transaction by the drain loop.
const WRITE_BATCH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Request => "REQUEST",
            Direction::Response => "RESPONSE",
        }
    }
}

/// One append-only audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub scan_id: String,
    pub timestamp: String,
    /// "BLOCK", "ALLOW", or "ALLOW_SUPPRESSED".
    pub action: String,
    pub direction: String,
    pub rule_id: Option<String>,
    pub risk_level: Option<String>,
    pub redacted_excerpt: Option<String>,
    /// Source key id — never the plaintext key.
    pub key_id: String,
    pub upstream: Option<String>,
    pub was_streaming: bool,
    pub tokens_delivered: Option<u64>,
    pub test: bool,
    pub suppressed_by_allowlist: bool,
    pub truncated: bool,
    pub original_length: Option<u64>,
    /// Entity types found by an advisory NLP pass, never the matched text.
    pub advisory_entities: Option<Vec<String>>,
}

impl AuditEvent {
    /// Build an event from a scan result. ALLOW results get no rule fields.
    pub fn from_scan(
        result: &ScanResult,
        direction: Direction,
        key_id: &str,
        upstream: Option<&str>,
        was_streaming: bool,
    ) -> Self {
        let action = if result.suppressed_by_allowlist {
            "ALLOW_SUPPRESSED"
        } else if result.decision.is_block() {
            "BLOCK"
        } else {
            "ALLOW"
        };
        Self {
            scan_id: result.scan_id.clone(),
            timestamp: now_rfc3339(),
            action: action.to_string(),
            direction: direction.as_str().to_string(),
            rule_id: result.rule_id.clone(),
            risk_level: result.risk_level.map(|r| r.as_str().to_string()),
            redacted_excerpt: result.redacted_excerpt.clone(),
            key_id: key_id.to_string(),
            upstream: upstream.map(str::to_string),
            was_streaming,
            tokens_delivered: result.tokens_delivered,
            test: result.test,
            suppressed_by_allowlist: result.suppressed_by_allowlist,
            truncated: false,
            original_length: None,
            advisory_entities: None,
        }
    }
}

/// Destination for audit batches. The sqlite store is the primary; a remote
/// table can be attached as a best-effort secondary.
pub trait AuditSink: Send + Sync {
    fn log_batch(&self, events: &[AuditEvent]);
}

/// Cheap-to-clone handle for emitting events from the request path.
#[derive(Clone)]
pub struct AuditHandle {
    tx: mpsc::Sender<AuditEvent>,
    metrics: Arc<Metrics>,
}

impl AuditHandle {
    /// Enqueue an event without blocking. Overflow drops the event and
    /// increments the drop counter.
    pub fn emit(&self, event: AuditEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                let depth = (self.tx.max_capacity() - self.tx.capacity()) as u64;
                self.metrics.set_audit_queue_depth(depth);
            }
            Err(_) => {
                self.metrics.record_audit_drop();
                tracing::warn!("audit channel full — event dropped");
            }
        }
    }
}

/// Start the audit pipeline: returns the emission handle and spawns the
/// writer. The writer drains batches on a blocking thread — rusqlite never
/// runs on the async workers.
pub fn start_pipeline(
    store: Arc<SqliteAuditStore>,
    secondary: Option<Arc<dyn AuditSink>>,
    metrics: Arc<Metrics>,
) -> AuditHandle {
    let (tx, rx) = mpsc::channel::<AuditEvent>(AUDIT_CHANNEL_CAPACITY);
    let handle = AuditHandle {
        tx,
        metrics: metrics.clone(),
    };

    tokio::task::spawn_blocking(move || writer_loop(rx, store, secondary, metrics));
    handle
}

fn writer_loop(
    mut rx: mpsc::Receiver<AuditEvent>,
    store: Arc<SqliteAuditStore>,
    secondary: Option<Arc<dyn AuditSink>>,
    metrics: Arc<Metrics>,
) {
    while let Some(first) = rx.blocking_recv() {
        let mut batch = Vec::with_capacity(WRITE_BATCH);
        batch.push(first);
        while batch.len() < WRITE_BATCH {
            match rx.try_recv() {
                Ok(event) => batch.push(event),
                Err(_) => break,
            }
        }

        if let Err(e) = store.log_batch_tx(&batch) {
            // Primary write failures are counted, never surfaced to requests
            metrics.record_audit_drop();
            tracing::error!(error = %e, count = batch.len(), "audit batch write failed");
        }
        if let Some(sink) = &secondary {
            sink.log_batch(&batch);
        }
        metrics.set_audit_queue_depth(0);
    }
    tracing::debug!("audit writer stopped");
}

/// Current UTC time as an RFC 3339 string with second precision.
pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
