// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// Embedded SQL audit store
//
// WAL mode so dashboard readers never block the writer. Schema version is
// guarded with PRAGMA user_version; an unknown version refuses startup.
// Writes are INSERT OR IGNORE on the scan_id+direction+rule_id unique
// constraint so replayed batches stay idempotent while a stream's advisory
// NLP event and its terminal event coexist under one scan_id.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;

use super::AuditEvent;

const SCHEMA_VERSION: i64 = 1;

const CREATE_SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS audit_events (
    id                      INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id                 TEXT NOT NULL,
    timestamp               TEXT NOT NULL,
    action                  TEXT NOT NULL CHECK(action IN ('ALLOW', 'BLOCK', 'ALLOW_SUPPRESSED')),
    direction               TEXT NOT NULL CHECK(direction IN ('REQUEST', 'RESPONSE')),
    rule_id                 TEXT,
    risk_level              TEXT CHECK(risk_level IN ('CRITICAL', 'HIGH', 'MEDIUM', 'LOW') OR risk_level IS NULL),
    redacted_excerpt        TEXT,
    key_id                  TEXT NOT NULL,
    upstream                TEXT,
    was_streaming           INTEGER NOT NULL DEFAULT 0,
    tokens_delivered        INTEGER,
    test                    INTEGER NOT NULL DEFAULT 0,
    suppressed_by_allowlist INTEGER NOT NULL DEFAULT 0,
    truncated               INTEGER NOT NULL DEFAULT 0,
    original_length         INTEGER,
    advisory_entities       TEXT,
    UNIQUE(scan_id, direction, rule_id)
);
CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_events(timestamp DESC);
CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_events(action);
";

#[derive(Debug, thiserror::Error)]
pub enum AuditStoreError {
    #[error("audit database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("unsupported audit database schema version {0} — delete the audit db to reset")]
    SchemaVersion(i64),

    #[error("audit database io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The primary audit sink, owned by the writer thread.
#[derive(Debug)]
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteAuditStore {
    /// Open (or create) the store. Applies WAL mode, the schema, 0600 file
    /// permissions, and the version guard.
    pub fn open(path: &Path) -> Result<Self, AuditStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(CREATE_SCHEMA_SQL)?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
            }
            v if v == SCHEMA_VERSION => {}
            v => return Err(AuditStoreError::SchemaVersion(v)),
        }

        restrict_permissions(path);

        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> Result<Self, AuditStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_SCHEMA_SQL)?;
        conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write a batch inside a single transaction.
    pub fn log_batch_tx(&self, events: &[AuditEvent]) -> Result<(), AuditStoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO audit_events
                 (scan_id, timestamp, action, direction, rule_id, risk_level,
                  redacted_excerpt, key_id, upstream, was_streaming,
                  tokens_delivered, test, suppressed_by_allowlist, truncated,
                  original_length, advisory_entities)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            )?;
            for e in events {
                let advisory = e
                    .advisory_entities
                    .as_ref()
                    .map(|v| serde_json::to_string(v).unwrap_or_default());
                stmt.execute(rusqlite::params![
                    e.scan_id,
                    e.timestamp,
                    e.action,
                    e.direction,
                    e.rule_id,
                    e.risk_level,
                    e.redacted_excerpt,
                    e.key_id,
                    e.upstream,
                    e.was_streaming as i64,
                    e.tokens_delivered.map(|t| t as i64),
                    e.test as i64,
                    e.suppressed_by_allowlist as i64,
                    e.truncated as i64,
                    e.original_length.map(|l| l as i64),
                    advisory,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Most recent events, newest first.
    pub fn query_recent(&self, limit: usize) -> Result<Vec<AuditEvent>, AuditStoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare_cached(
            "SELECT scan_id, timestamp, action, direction, rule_id, risk_level,
                    redacted_excerpt, key_id, upstream, was_streaming,
                    tokens_delivered, test, suppressed_by_allowlist, truncated,
                    original_length, advisory_entities
             FROM audit_events ORDER BY id DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            let advisory_raw: Option<String> = row.get(15)?;
            Ok(AuditEvent {
                scan_id: row.get(0)?,
                timestamp: row.get(1)?,
                action: row.get(2)?,
                direction: row.get(3)?,
                rule_id: row.get(4)?,
                risk_level: row.get(5)?,
                redacted_excerpt: row.get(6)?,
                key_id: row.get(7)?,
                upstream: row.get(8)?,
                was_streaming: row.get::<_, i64>(9)? != 0,
                tokens_delivered: row.get::<_, Option<i64>>(10)?.map(|t| t as u64),
                test: row.get::<_, i64>(11)? != 0,
                suppressed_by_allowlist: row.get::<_, i64>(12)? != 0,
                truncated: row.get::<_, i64>(13)? != 0,
                original_length: row.get::<_, Option<i64>>(14)?.map(|l| l as u64),
                advisory_entities: advisory_raw.and_then(|s| serde_json::from_str(&s).ok()),
            })
        })?;

        let mut events = Vec::new();
        for row in rows {
            events.push(row?);
        }
        Ok(events)
    }

    pub fn count_events(&self) -> Result<u64, AuditStoreError> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_events", [], |r| r.get(0))?;
        Ok(count as u64)
    }

    /// Delete events older than the retention cutoff. Events exactly at the
    /// boundary are kept.
    pub fn prune_old_events(&self, retention_days: u32) -> Result<usize, AuditStoreError> {
        let cutoff = (chrono::Utc::now() - chrono::Duration::days(retention_days as i64))
            .to_rfc3339_opts(chrono::SecondsFormat::Secs, true);

        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute(
            "DELETE FROM audit_events WHERE timestamp < ?1",
            [cutoff.as_str()],
        )?;
        if deleted > 0 {
            tracing::info!(deleted, retention_days, "audit retention prune complete");
        }
        Ok(deleted)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
