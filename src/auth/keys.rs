// Copyright 2026 The OnGarde Project
// SPDX-License-Identifier: Apache-2.0

// API key store
//
// Keys are `ong-` + a 26-char ULID (the public id) + 26 chars of fresh
// CSPRNG output (the secret body, 130 bits). Only the bcrypt hash of the
// full plaintext is persisted; the plaintext leaves this module exactly once,
// from `create`. Verification is bcrypt (constant-time comparison) behind a
// bounded cache of validated plaintexts, since cost-12 bcrypt runs ~80ms.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rand::RngCore;
use rusqlite::Connection;
use serde::Serialize;

use crate::audit::now_rfc3339;

/// Plaintext key prefix.
pub const KEY_PREFIX: &str = "ong-";

/// bcrypt cost factor.
const BCRYPT_COST: u32 = 12;

const ID_LEN: usize = 26;
const SECRET_LEN: usize = 26;

/// Validated plaintext -> key id cache bound.
const CACHE_MAX: usize = 1024;

const CREATE_TABLE_SQL: &str = "
CREATE TABLE IF NOT EXISTS api_keys (
    id           TEXT PRIMARY KEY,
    key_hash     TEXT NOT NULL,
    name         TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    last_used_at TEXT,
    revoked_at   TEXT
);
";

#[derive(Debug, thiserror::Error)]
pub enum KeyStoreError {
    #[error("key store database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("key store io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("key hashing failed: {0}")]
    Hash(#[from] bcrypt::BcryptError),

    #[error("key not found or already revoked")]
    NotFound,
}

/// Masked key record for listings. The plaintext is unrecoverable from here.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyRecord {
    pub id: String,
    pub masked_key: String,
    pub name: String,
    pub created_at: String,
    pub last_used_at: Option<String>,
    pub revoked_at: Option<String>,
}

/// Long-lived mutable singleton over the key database.
pub struct KeyStore {
    conn: Mutex<Connection>,
    cache: Mutex<HashMap<String, String>>,
}

impl KeyStore {
    /// Open (or create) the store at `path` with 0600 permissions.
    pub fn open(path: &Path) -> Result<Self, KeyStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(CREATE_TABLE_SQL)?;
        restrict_permissions(path);
        Ok(Self {
            conn: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn open_in_memory() -> Result<Self, KeyStoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLE_SQL)?;
        Ok(Self {
            conn: Mutex::new(conn),
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Generate and store a new key. Returns the record and the plaintext —
    /// the only time the plaintext ever exists outside the caller's hands.
    pub fn create(&self, name: &str) -> Result<(ApiKeyRecord, String), KeyStoreError> {
        let id = ulid::Ulid::new().to_string();
        let plaintext = format!("{KEY_PREFIX}{id}{}", random_secret());
        let hash = bcrypt::hash(&plaintext, BCRYPT_COST)?;
        let created_at = now_rfc3339();

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO api_keys (id, key_hash, name, created_at) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![id, hash, name, created_at],
        )?;

        tracing::info!(key_id = %id, name, "api key created");
        Ok((
            ApiKeyRecord {
                masked_key: mask(&id),
                id,
                name: name.to_string(),
                created_at,
                last_used_at: None,
                revoked_at: None,
            },
            plaintext,
        ))
    }

    /// Verify a plaintext key. Returns the key id when the key exists, is
    /// not revoked, and its hash verifies.
    pub fn verify(&self, plaintext: &str) -> Option<String> {
        let id = parse_key_id(plaintext)?;

        if let Some(cached) = self.cache.lock().unwrap().get(plaintext) {
            return Some(cached.clone());
        }

        let hash: String = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT key_hash FROM api_keys WHERE id = ?1 AND revoked_at IS NULL",
                [&id],
                |row| row.get(0),
            )
            .ok()?
        };

        match bcrypt::verify(plaintext, &hash) {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => {
                tracing::warn!(error = %e, "bcrypt verify error");
                return None;
            }
        }

        let mut cache = self.cache.lock().unwrap();
        if cache.len() >= CACHE_MAX {
            cache.clear();
        }
        cache.insert(plaintext.to_string(), id.clone());
        drop(cache);

        self.touch_last_used(&id);
        Some(id)
    }

    /// Active (non-revoked) key listings, newest first, masked.
    pub fn list(&self) -> Result<Vec<ApiKeyRecord>, KeyStoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, created_at, last_used_at, revoked_at
             FROM api_keys WHERE revoked_at IS NULL ORDER BY id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            Ok(ApiKeyRecord {
                masked_key: mask(&id),
                id,
                name: row.get(1)?,
                created_at: row.get(2)?,
                last_used_at: row.get(3)?,
                revoked_at: row.get(4)?,
            })
        })?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Revoke a key by id. Clears the verification cache before returning.
    pub fn revoke(&self, id: &str) -> Result<(), KeyStoreError> {
        let changed = {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE api_keys SET revoked_at = ?1 WHERE id = ?2 AND revoked_at IS NULL",
                rusqlite::params![now_rfc3339(), id],
            )?
        };
        // Cache must be cleared before revoke returns, not fire-and-forget
        self.cache.lock().unwrap().clear();
        if changed == 0 {
            return Err(KeyStoreError::NotFound);
        }
        tracing::info!(key_id = %id, "api key revoked");
        Ok(())
    }

    /// Number of keys ever created (revoked included). The bootstrap
    /// exception applies only while this is zero.
    pub fn count(&self) -> u64 {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT COUNT(*) FROM api_keys", [], |r| r.get::<_, i64>(0))
            .map(|c| c as u64)
            .unwrap_or(0)
    }

    fn touch_last_used(&self, id: &str) {
        let conn = self.conn.lock().unwrap();
        let _ = conn.execute(
            "UPDATE api_keys SET last_used_at = ?1 WHERE id = ?2",
            rusqlite::params![now_rfc3339(), id],
        );
    }
}

/// Extract the key id portion from a plaintext key, or None when the shape
/// is wrong.
fn parse_key_id(plaintext: &str) -> Option<String> {
    let body = plaintext.strip_prefix(KEY_PREFIX)?;
    if body.len() < ID_LEN + SECRET_LEN {
        return None;
    }
    body.get(..ID_LEN).map(str::to_string)
}

fn mask(id: &str) -> String {
    let tail: String = id.chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
    format!("ong-...{tail}")
}

/// 26 chars of Crockford base32 over 16 random bytes (130 bits of secret).
fn random_secret() -> String {
    const ALPHABET: &[u8] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);

    let mut out = String::with_capacity(SECRET_LEN);
    let mut acc: u32 = 0;
    let mut bits = 0;
    for b in bytes {
        acc = (acc << 8) | b as u32;
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((acc >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 && out.len() < SECRET_LEN {
        out.push(ALPHABET[((acc << (5 - bits)) & 0x1f) as usize] as char);
    }
    out.truncate(SECRET_LEN);
    out
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}

/// Default key store location inside the state directory.
pub fn default_keys_path() -> PathBuf {
    crate::config::state_dir().join("keys.db")
}
