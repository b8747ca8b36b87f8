//! Tamper-evident audit journal: an append-only, hash-chained, newline
//! delimited JSON file.
//!
//! Every entry's `entry_hash` is the SHA-256 of the canonical
//! serialization (sorted keys, no whitespace) of every field except
//! `entry_hash` itself; `prev_hash` links to the previous entry's hash,
//! starting from 64 zero hex characters. The tail hash lives in memory
//! and is recovered at startup by reading the journal's last line.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::AuditError;

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Handshake,
    Relationship,
    Registration,
    ApiAuth,
    Admin,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub entry_id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub category: AuditCategory,
    pub action: String,
    pub actor: String,
    pub details: BTreeMap<String, Value>,
    pub prev_hash: String,
    pub entry_hash: String,
}

pub struct VerifyReport {
    pub ok: bool,
    pub entries_checked: u64,
    pub broken_at: Option<u64>,
    pub expected_hash: Option<String>,
    pub actual_hash: Option<String>,
}

struct State {
    file: Option<File>,
    tail_hash: String,
}

pub struct AuditJournal {
    path: PathBuf,
    enabled: bool,
    state: Mutex<State>,
}

impl AuditJournal {
    /// Opens (creating if absent) the journal at `path`, recovering the
    /// tail hash from the last line if the file is non-empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let tail_hash = Self::recover_tail_hash(&path)?;

        let file = OpenOptions::new().create(true).append(true).open(&path)?;

        Ok(Self {
            path,
            enabled: true,
            state: Mutex::new(State { file: Some(file), tail_hash }),
        })
    }

    /// A journal that discards every entry. Used when `audit.enabled` is
    /// `false`; `append` still succeeds (callers never branch on it) but
    /// nothing reaches disk and the chain never advances past genesis.
    pub fn disabled() -> Self {
        Self {
            path: PathBuf::new(),
            enabled: false,
            state: Mutex::new(State { file: None, tail_hash: GENESIS_HASH.to_string() }),
        }
    }

    fn recover_tail_hash(path: &Path) -> Result<String, AuditError> {
        if !path.exists() {
            return Ok(GENESIS_HASH.to_string());
        }
        let reader = BufReader::new(File::open(path)?);
        let mut last_hash = GENESIS_HASH.to_string();
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line)
                .map_err(|_| AuditError::Malformed(idx as u64))?;
            last_hash = entry.entry_hash;
        }
        Ok(last_hash)
    }

    /// Appends a new entry, returning the new tail hash.
    pub fn append(
        &self,
        category: AuditCategory,
        action: impl Into<String>,
        actor: impl Into<String>,
        details: BTreeMap<String, Value>,
    ) -> Result<String, AuditError> {
        if !self.enabled {
            return Ok(self.state.lock().expect("audit mutex poisoned").tail_hash.clone());
        }

        let mut state = self.state.lock().expect("audit mutex poisoned");

        let entry_id = Uuid::new_v4();
        let timestamp = chrono::Utc::now();
        let action = action.into();
        let actor = actor.into();
        let prev_hash = state.tail_hash.clone();

        let entry_hash = compute_hash(&entry_id, &timestamp, category, &action, &actor, &details, &prev_hash)?;

        let entry = AuditEntry {
            entry_id,
            timestamp,
            category,
            action,
            actor,
            details,
            prev_hash,
            entry_hash: entry_hash.clone(),
        };

        let line = serde_json::to_string(&entry)?;
        let file = state.file.as_mut().expect("append called on enabled journal without a file");
        writeln!(file, "{line}")?;
        file.flush()?;

        state.tail_hash = entry_hash.clone();
        Ok(entry_hash)
    }

    /// Recomputes every entry's hash from `from` onward and checks
    /// linkage, returning the offending entry and offset on mismatch.
    /// A disabled journal has no file and trivially verifies clean.
    pub fn verify(&self, from: u64) -> Result<VerifyReport, AuditError> {
        if !self.enabled {
            return Ok(VerifyReport { ok: true, entries_checked: 0, broken_at: None, expected_hash: None, actual_hash: None });
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut expected_prev = GENESIS_HASH.to_string();
        let mut checked = 0u64;

        for (offset, line) in reader.lines().enumerate() {
            let offset = offset as u64;
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line).map_err(|_| AuditError::Malformed(offset))?;

            if offset < from {
                expected_prev = entry.entry_hash;
                continue;
            }

            if entry.prev_hash != expected_prev {
                return Ok(VerifyReport {
                    ok: false,
                    entries_checked: checked,
                    broken_at: Some(offset + 1),
                    expected_hash: Some(expected_prev),
                    actual_hash: Some(entry.prev_hash),
                });
            }

            let recomputed = compute_hash(
                &entry.entry_id,
                &entry.timestamp,
                entry.category,
                &entry.action,
                &entry.actor,
                &entry.details,
                &entry.prev_hash,
            )?;

            if recomputed != entry.entry_hash {
                return Ok(VerifyReport {
                    ok: false,
                    entries_checked: checked,
                    broken_at: Some(offset + 1),
                    expected_hash: Some(recomputed),
                    actual_hash: Some(entry.entry_hash),
                });
            }

            expected_prev = entry.entry_hash;
            checked += 1;
        }

        Ok(VerifyReport {
            ok: true,
            entries_checked: checked,
            broken_at: None,
            expected_hash: None,
            actual_hash: None,
        })
    }

    pub fn tail_hash(&self) -> String {
        self.state.lock().expect("audit mutex poisoned").tail_hash.clone()
    }
}

#[allow(clippy::too_many_arguments)]
fn compute_hash(
    entry_id: &Uuid,
    timestamp: &chrono::DateTime<chrono::Utc>,
    category: AuditCategory,
    action: &str,
    actor: &str,
    details: &BTreeMap<String, Value>,
    prev_hash: &str,
) -> Result<String, AuditError> {
    let mut canonical: BTreeMap<&str, Value> = BTreeMap::new();
    canonical.insert("entry_id", Value::String(entry_id.to_string()));
    canonical.insert("timestamp", Value::String(timestamp.to_rfc3339()));
    canonical.insert("category", serde_json::to_value(category)?);
    canonical.insert("action", Value::String(action.to_string()));
    canonical.insert("actor", Value::String(actor.to_string()));
    canonical.insert("details", serde_json::to_value(details)?);
    canonical.insert("prev_hash", Value::String(prev_hash.to_string()));

    let bytes = serde_json::to_vec(&canonical)?;
    let digest = Sha256::digest(&bytes);
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn details(pairs: &[(&str, &str)]) -> BTreeMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::String(v.to_string()))).collect()
    }

    #[test]
    fn first_entry_chains_from_genesis() {
        let dir = tempdir().unwrap();
        let journal = AuditJournal::open(dir.path().join("audit.jsonl")).unwrap();
        journal
            .append(AuditCategory::Handshake, "handshake_completed", "p1", details(&[]))
            .unwrap();
        let report = journal.verify(0).unwrap();
        assert!(report.ok);
        assert_eq!(report.entries_checked, 1);
    }

    #[test]
    fn chain_detects_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let journal = AuditJournal::open(&path).unwrap();
        for i in 0..5 {
            journal
                .append(AuditCategory::Handshake, "handshake_completed", &format!("p{i}"), details(&[]))
                .unwrap();
        }
        drop(journal);

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
        let mut corrupted: serde_json::Value = serde_json::from_str(&lines[2]).unwrap();
        corrupted["details"]["tampered"] = Value::String("yes".into());
        lines[2] = serde_json::to_string(&corrupted).unwrap();
        std::fs::write(&path, lines.join("\n") + "\n").unwrap();

        let reopened = AuditJournal::open(&path).unwrap();
        let report = reopened.verify(0).unwrap();
        assert!(!report.ok);
        assert_eq!(report.broken_at, Some(3));
    }

    #[test]
    fn disabled_journal_discards_entries_and_verifies_clean() {
        let journal = AuditJournal::disabled();
        journal
            .append(AuditCategory::Admin, "config_reloaded", "operator", details(&[]))
            .unwrap();
        assert_eq!(journal.tail_hash(), GENESIS_HASH);
        assert!(journal.verify(0).unwrap().ok);
    }

    #[test]
    fn tail_hash_recovers_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let hash_before = {
            let journal = AuditJournal::open(&path).unwrap();
            journal
                .append(AuditCategory::Relationship, "relationship_created", "p1", details(&[]))
                .unwrap()
        };
        let reopened = AuditJournal::open(&path).unwrap();
        assert_eq!(reopened.tail_hash(), hash_before);
    }
}
