//! API key issuance and verification.
//!
//! Raw key material is surfaced exactly once, at creation. Everything
//! persisted afterward is the SHA-256 hash; lookups go through the
//! hash's unique index rather than a linear scan, which is already
//! timing-safe in practice since the hash is unpredictable without the
//! raw key, but `verify` still runs a constant-time byte comparison
//! against the fetched row as defense in depth.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage::StorageEngine;

/// Scope granted by a key. Read routes require at least `ReadOnly`; the
/// provider-create route requires `Admin`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    ReadOnly,
    Admin,
}

impl PermissionLevel {
    fn as_str(self) -> &'static str {
        match self {
            PermissionLevel::ReadOnly => "read_only",
            PermissionLevel::Admin => "admin",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "admin" => PermissionLevel::Admin,
            _ => PermissionLevel::ReadOnly,
        }
    }
}

/// A key as listed back to an operator; never includes the hash or raw value.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeySummary {
    pub key_id: Uuid,
    pub name: String,
    pub permission_level: PermissionLevel,
    pub created_at: chrono::DateTime<Utc>,
    pub revoked_at: Option<chrono::DateTime<Utc>>,
    pub last_used_at: Option<chrono::DateTime<Utc>>,
}

/// Returned only from [`ApiKeyStore::create`]; the raw key is never
/// persisted or returned again.
pub struct CreatedApiKey {
    pub summary: ApiKeySummary,
    pub raw_key: String,
}

pub struct ApiKeyStore<'a> {
    storage: &'a StorageEngine,
}

fn hash_key(raw_key: &str) -> String {
    hex::encode(Sha256::digest(raw_key.as_bytes()))
}

/// Constant-time equality over two hex digests of equal expected length.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.bytes().zip(b.bytes()) {
        diff |= x ^ y;
    }
    diff == 0
}

impl<'a> ApiKeyStore<'a> {
    pub fn new(storage: &'a StorageEngine) -> Self {
        Self { storage }
    }

    /// Mints a new key: `nrn_<32 random bytes, base64url>`. The raw value
    /// is returned once; only its SHA-256 hash is stored.
    pub fn create(&self, name: &str, permission_level: PermissionLevel) -> Result<CreatedApiKey, StorageError> {
        let mut random = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut random);
        let raw_key = format!("nrn_{}", URL_SAFE_NO_PAD.encode(random));
        let key_hash = hash_key(&raw_key);
        let key_id = Uuid::new_v4();
        let now = Utc::now();

        self.storage.run(
            "INSERT INTO api_keys (key_id, name, key_hash, permission_level, created_at, revoked_at, last_used_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, NULL)",
            &[
                &key_id.to_string(),
                &name,
                &key_hash,
                &permission_level.as_str(),
                &now.to_rfc3339(),
            ],
        )?;

        Ok(CreatedApiKey {
            summary: ApiKeySummary {
                key_id,
                name: name.to_string(),
                permission_level,
                created_at: now,
                revoked_at: None,
                last_used_at: None,
            },
            raw_key,
        })
    }

    /// Verifies a raw presented key, updating `last_used_at` on success.
    /// Revoked keys never verify.
    pub fn verify(&self, raw_key: &str) -> Result<Option<(Uuid, PermissionLevel)>, StorageError> {
        let presented_hash = hash_key(raw_key);

        let row = self.storage.get(
            "SELECT key_id, key_hash, permission_level, revoked_at FROM api_keys WHERE key_hash = ?1",
            &[&presented_hash],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        let Some((key_id, stored_hash, permission_level, revoked_at)) = row else {
            return Ok(None);
        };

        if !constant_time_eq(&presented_hash, &stored_hash) {
            return Ok(None);
        }
        if revoked_at.is_some() {
            return Ok(None);
        }

        let key_id = Uuid::parse_str(&key_id).map_err(|_| StorageError::NotFound)?;
        self.storage.run(
            "UPDATE api_keys SET last_used_at = ?1 WHERE key_id = ?2",
            &[&Utc::now().to_rfc3339(), &key_id.to_string()],
        )?;

        Ok(Some((key_id, PermissionLevel::parse(&permission_level))))
    }

    pub fn revoke(&self, key_id: Uuid) -> Result<bool, StorageError> {
        let result = self.storage.run(
            "UPDATE api_keys SET revoked_at = ?1 WHERE key_id = ?2 AND revoked_at IS NULL",
            &[&Utc::now().to_rfc3339(), &key_id.to_string()],
        )?;
        Ok(result.changes > 0)
    }

    pub fn list(&self) -> Result<Vec<ApiKeySummary>, StorageError> {
        self.storage.all(
            "SELECT key_id, name, permission_level, created_at, revoked_at, last_used_at FROM api_keys ORDER BY created_at",
            &[],
            |row| {
                Ok(ApiKeySummary {
                    key_id: Uuid::parse_str(&row.get::<_, String>(0)?).unwrap_or_else(|_| Uuid::nil()),
                    name: row.get(1)?,
                    permission_level: PermissionLevel::parse(&row.get::<_, String>(2)?),
                    created_at: row.get::<_, String>(3)?.parse().unwrap_or_else(|_| Utc::now()),
                    revoked_at: row
                        .get::<_, Option<String>>(4)?
                        .and_then(|s| s.parse().ok()),
                    last_used_at: row
                        .get::<_, Option<String>>(5)?
                        .and_then(|s| s.parse().ok()),
                })
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raw_key_verifies_once_created() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let store = ApiKeyStore::new(&engine);
        let created = store.create("ci-bot", PermissionLevel::ReadOnly).unwrap();

        let verified = store.verify(&created.raw_key).unwrap();
        assert_eq!(verified.map(|(id, _)| id), Some(created.summary.key_id));
    }

    #[test]
    fn revoked_key_fails_verification() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let store = ApiKeyStore::new(&engine);
        let created = store.create("ci-bot", PermissionLevel::Admin).unwrap();
        store.revoke(created.summary.key_id).unwrap();

        assert!(store.verify(&created.raw_key).unwrap().is_none());
    }

    #[test]
    fn wrong_key_does_not_verify() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let store = ApiKeyStore::new(&engine);
        store.create("ci-bot", PermissionLevel::ReadOnly).unwrap();

        assert!(store.verify("nrn_not-a-real-key").unwrap().is_none());
    }
}
