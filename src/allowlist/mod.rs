// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

//! Allowlist suppressions with hot reload.
//!
//! The allowlist file maps text-contains / regex / rule-id entries to
//! suppressions: a BLOCK whose content or rule matches an entry is downgraded
//! to PASS and audited as `ALLOW_SUPPRESSED`. The file is watched with the
//! [`notify`] crate and reloaded on change; a parse error leaves the previous
//! set in force.
//!
//! Readers never hold the lock across a scan: `snapshot()` clones an `Arc`
//! to the immutable current set, and reloads swap the pointer.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;

use crate::scanner::{Decision, ScanResult, SCANNER_ERROR, SCANNER_TIMEOUT};

/// A single suppression entry.
#[derive(Debug)]
pub enum AllowlistEntry {
    TextContains { needle: String, reason: Option<String> },
    Regex { pattern: regex::Regex, reason: Option<String> },
    RuleId { rule_id: String, reason: Option<String> },
}

impl AllowlistEntry {
    pub fn reason(&self) -> Option<&str> {
        match self {
            AllowlistEntry::TextContains { reason, .. }
            | AllowlistEntry::Regex { reason, .. }
            | AllowlistEntry::RuleId { reason, .. } => reason.as_deref(),
        }
    }
}

/// Immutable published set. Swapped wholesale on reload.
#[derive(Debug, Default)]
pub struct AllowlistSet {
    pub entries: Vec<AllowlistEntry>,
}

impl AllowlistSet {
    /// Find the first entry suppressing this block candidate. System failure
    /// rule ids are never suppressible.
    pub fn matching_entry(&self, content: &str, rule_id: Option<&str>) -> Option<&AllowlistEntry> {
        if matches!(rule_id, Some(SCANNER_ERROR) | Some(SCANNER_TIMEOUT)) {
            return None;
        }
        self.entries.iter().find(|entry| match entry {
            AllowlistEntry::TextContains { needle, .. } => content.contains(needle.as_str()),
            AllowlistEntry::Regex { pattern, .. } => pattern.is_match(content),
            AllowlistEntry::RuleId { rule_id: id, .. } => rule_id == Some(id.as_str()),
        })
    }
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    text_contains: Option<String>,
    regex: Option<String>,
    rule_id: Option<String>,
    reason: Option<String>,
}

fn parse_entries(yaml: &str) -> Result<Vec<AllowlistEntry>, serde_yaml::Error> {
    let raw: Vec<RawEntry> = serde_yaml::from_str(yaml)?;
    let mut entries = Vec::with_capacity(raw.len());

    for (i, item) in raw.into_iter().enumerate() {
        if let Some(needle) = item.text_contains {
            entries.push(AllowlistEntry::TextContains {
                needle,
                reason: item.reason,
            });
        } else if let Some(pattern) = item.regex {
            match regex::Regex::new(&pattern) {
                Ok(compiled) => entries.push(AllowlistEntry::Regex {
                    pattern: compiled,
                    reason: item.reason,
                }),
                Err(e) => {
                    tracing::warn!(index = i, pattern = %pattern, error = %e,
                        "allowlist regex entry invalid — skipping");
                }
            }
        } else if let Some(rule_id) = item.rule_id {
            entries.push(AllowlistEntry::RuleId {
                rule_id,
                reason: item.reason,
            });
        } else {
            tracing::warn!(index = i, "allowlist entry has no recognized key — skipping");
        }
    }
    Ok(entries)
}

/// Long-lived mutable singleton holding the current allowlist set.
pub struct Allowlist {
    set: RwLock<Arc<AllowlistSet>>,
    path: PathBuf,
}

impl Allowlist {
    /// Load the allowlist from `path`. A missing file yields an empty set
    /// (not an error).
    pub fn load(path: &Path) -> Arc<Self> {
        let allowlist = Arc::new(Self {
            set: RwLock::new(Arc::new(AllowlistSet::default())),
            path: path.to_path_buf(),
        });
        allowlist.reload();
        allowlist
    }

    /// Snapshot of the current set. Cheap: clones an `Arc`.
    pub fn snapshot(&self) -> Arc<AllowlistSet> {
        self.set.read().unwrap().clone()
    }

    /// Re-read the file. On parse or read error the previous set stays in
    /// force and a warning is logged. Returns the entry count on success.
    pub fn reload(&self) -> Option<usize> {
        let yaml = match std::fs::read_to_string(&self.path) {
            Ok(y) => y,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                *self.set.write().unwrap() = Arc::new(AllowlistSet::default());
                return Some(0);
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e,
                    "allowlist read failed — keeping prior set");
                return None;
            }
        };

        match parse_entries(&yaml) {
            Ok(entries) => {
                let count = entries.len();
                *self.set.write().unwrap() = Arc::new(AllowlistSet { entries });
                tracing::info!(count, path = %self.path.display(), "allowlist loaded");
                Some(count)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e,
                    "allowlist parse failed — keeping prior set");
                None
            }
        }
    }

    /// Start a file watcher that reloads on change. The returned handle must
    /// be kept alive for the duration of the watch.
    pub fn start_watcher(this: &Arc<Self>) -> notify::Result<RecommendedWatcher> {
        let watched = Arc::clone(this);
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                        watched.reload();
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "allowlist watcher error");
                }
            }
        })?;
        // Watch the parent directory: editors replace files rather than
        // writing in place, which drops a direct file watch.
        let watch_target = this.path.parent().unwrap_or(&this.path);
        watcher.watch(watch_target, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %this.path.display(), "allowlist watcher started");
        Ok(watcher)
    }
}

/// Check a BLOCK result against the set; a matching entry downgrades it to
/// PASS with `suppressed_by_allowlist` set. PASS results are untouched.
pub fn apply_allowlist(result: ScanResult, content: &str, set: &AllowlistSet) -> ScanResult {
    if !result.decision.is_block() {
        return result;
    }
    match set.matching_entry(content, result.rule_id.as_deref()) {
        Some(entry) => {
            tracing::info!(
                scan_id = %result.scan_id,
                rule_id = result.rule_id.as_deref().unwrap_or(""),
                reason = entry.reason().unwrap_or(""),
                "allowlist suppressed block"
            );
            ScanResult {
                decision: Decision::Pass,
                suppressed_by_allowlist: true,
                ..result
            }
        }
        None => result,
    }
}
