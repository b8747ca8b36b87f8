//! Relationship & consent store: CRUD over relationships, backing both the
//! handshake broker and the REST API's read-mostly views.

use chrono::Utc;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StorageError;
use crate::storage::StorageEngine;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RelationshipStatus {
    Pending,
    Active,
    Suspended,
    Terminated,
}

impl RelationshipStatus {
    fn as_str(self) -> &'static str {
        match self {
            RelationshipStatus::Pending => "pending",
            RelationshipStatus::Active => "active",
            RelationshipStatus::Suspended => "suspended",
            RelationshipStatus::Terminated => "terminated",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "pending" => RelationshipStatus::Pending,
            "active" => RelationshipStatus::Active,
            "suspended" => RelationshipStatus::Suspended,
            "terminated" => RelationshipStatus::Terminated,
            other => panic!("unknown relationship status persisted: {other}"),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RelationshipStatus::Terminated)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub relationship_id: Uuid,
    pub patient_agent_id: String,
    /// Never returned over the REST surface.
    #[serde(skip_serializing)]
    pub patient_public_key: String,
    pub provider_npi: String,
    pub status: RelationshipStatus,
    pub consented_actions: Vec<String>,
    pub created_at: chrono::DateTime<Utc>,
    pub updated_at: chrono::DateTime<Utc>,
}

/// A new relationship, as materialized by the broker on first successful
/// handshake for a `(patient_public_key, provider_npi)` pair.
pub struct NewRelationship {
    pub patient_agent_id: String,
    pub patient_public_key: String,
    pub provider_npi: String,
    pub consented_actions: Vec<String>,
}

pub struct ListFilter {
    pub status: Option<RelationshipStatus>,
    pub limit: u32,
    pub offset: u32,
}

pub struct ListResult {
    pub items: Vec<Relationship>,
    pub total: u32,
    pub offset: u32,
    pub limit: u32,
}

pub struct RelationshipStore<'a> {
    storage: &'a StorageEngine,
}

fn row_to_relationship(row: &Row<'_>) -> rusqlite::Result<Relationship> {
    let id_str: String = row.get(0)?;
    let status_str: String = row.get(4)?;
    let actions_json: String = row.get(5)?;
    Ok(Relationship {
        relationship_id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        patient_agent_id: row.get(1)?,
        patient_public_key: row.get(2)?,
        provider_npi: row.get(3)?,
        status: RelationshipStatus::parse(&status_str),
        consented_actions: serde_json::from_str(&actions_json).unwrap_or_default(),
        created_at: row.get::<_, String>(6)?.parse().unwrap_or_else(|_| Utc::now()),
        updated_at: row.get::<_, String>(7)?.parse().unwrap_or_else(|_| Utc::now()),
    })
}

const SELECT_COLUMNS: &str = "relationship_id, patient_agent_id, patient_public_key, provider_npi, status, consented_actions, created_at, updated_at";

impl<'a> RelationshipStore<'a> {
    pub fn new(storage: &'a StorageEngine) -> Self {
        Self { storage }
    }

    /// Creates a new relationship in `active` status (the only status the
    /// broker ever creates one in).
    pub fn create(&self, new: NewRelationship) -> Result<Relationship, StorageError> {
        let id = Uuid::new_v4();
        let now = Utc::now().to_rfc3339();
        let actions_json = serde_json::to_string(&new.consented_actions).unwrap_or_else(|_| "[]".into());

        self.storage.run(
            &format!(
                "INSERT INTO relationships ({SELECT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, 'active', ?5, ?6, ?6)"
            ),
            &[
                &id.to_string(),
                &new.patient_agent_id,
                &new.patient_public_key,
                &new.provider_npi,
                &actions_json,
                &now,
            ],
        )?;

        Ok(Relationship {
            relationship_id: id,
            patient_agent_id: new.patient_agent_id,
            patient_public_key: new.patient_public_key,
            provider_npi: new.provider_npi,
            status: RelationshipStatus::Active,
            consented_actions: new.consented_actions,
            created_at: now.parse().unwrap_or_else(|_| Utc::now()),
            updated_at: now.parse().unwrap_or_else(|_| Utc::now()),
        })
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Relationship>, StorageError> {
        self.storage.get(
            &format!("SELECT {SELECT_COLUMNS} FROM relationships WHERE relationship_id = ?1"),
            &[&id.to_string()],
            row_to_relationship,
        )
    }

    /// Finds the non-terminated relationship for `(pubkey, npi)`, if any,
    /// optionally narrowed to a specific status.
    pub fn find_by_pair(
        &self,
        pubkey: &str,
        npi: &str,
        status: Option<RelationshipStatus>,
    ) -> Result<Option<Relationship>, StorageError> {
        match status {
            Some(status) => self.storage.get(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM relationships WHERE patient_public_key = ?1 AND provider_npi = ?2 AND status = ?3"
                ),
                &[&pubkey, &npi, &status.as_str()],
                row_to_relationship,
            ),
            None => self.storage.get(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM relationships WHERE patient_public_key = ?1 AND provider_npi = ?2 AND status <> 'terminated'"
                ),
                &[&pubkey, &npi],
                row_to_relationship,
            ),
        }
    }

    pub fn list(&self, filter: ListFilter) -> Result<ListResult, StorageError> {
        let limit = filter.limit.clamp(1, 100);
        let offset = filter.offset;

        let (items, total) = match filter.status {
            Some(status) => {
                let items = self.storage.all(
                    &format!(
                        "SELECT {SELECT_COLUMNS} FROM relationships WHERE status = ?1 ORDER BY created_at LIMIT ?2 OFFSET ?3"
                    ),
                    &[&status.as_str(), &limit, &offset],
                    row_to_relationship,
                )?;
                let total: i64 = self
                    .storage
                    .get(
                        "SELECT COUNT(*) FROM relationships WHERE status = ?1",
                        &[&status.as_str()],
                        |row| row.get(0),
                    )?
                    .unwrap_or(0);
                (items, total)
            }
            None => {
                let items = self.storage.all(
                    &format!("SELECT {SELECT_COLUMNS} FROM relationships ORDER BY created_at LIMIT ?1 OFFSET ?2"),
                    &[&limit, &offset],
                    row_to_relationship,
                )?;
                let total: i64 = self
                    .storage
                    .get("SELECT COUNT(*) FROM relationships", &[], |row| row.get(0))?
                    .unwrap_or(0);
                (items, total)
            }
        };

        Ok(ListResult {
            items,
            total: total as u32,
            offset,
            limit,
        })
    }

    /// Updates status; callers are responsible for invariants (terminal
    /// statuses are never transitioned out by this layer alone — see
    /// [`RelationshipStore::terminate`]).
    pub fn update_status(&self, id: Uuid, status: RelationshipStatus) -> Result<(), StorageError> {
        self.storage.run(
            "UPDATE relationships SET status = ?1, updated_at = ?2 WHERE relationship_id = ?3 AND status <> 'terminated'",
            &[&status.as_str(), &Utc::now().to_rfc3339(), &id.to_string()],
        )?;
        Ok(())
    }

    /// Transitions to `terminated`. Idempotent: terminating an already
    /// terminated relationship is a no-op, never a revival.
    pub fn terminate(&self, id: Uuid, _reason: &str) -> Result<(), StorageError> {
        self.storage.run(
            "UPDATE relationships SET status = 'terminated', updated_at = ?1 WHERE relationship_id = ?2 AND status <> 'terminated'",
            &[&Utc::now().to_rfc3339(), &id.to_string()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(engine: &StorageEngine) -> RelationshipStore<'_> {
        RelationshipStore::new(engine)
    }

    #[test]
    fn create_then_find_by_pair() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let store = store(&engine);
        let created = store
            .create(NewRelationship {
                patient_agent_id: "p1".into(),
                patient_public_key: "pubkey-1".into(),
                provider_npi: "1234567893".into(),
                consented_actions: vec!["office_visit".into()],
            })
            .unwrap();

        let found = store.find_by_pair("pubkey-1", "1234567893", None).unwrap().unwrap();
        assert_eq!(found.relationship_id, created.relationship_id);
        assert_eq!(found.status, RelationshipStatus::Active);
    }

    #[test]
    fn non_terminated_pair_uniqueness_is_enforced() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let store = store(&engine);
        store
            .create(NewRelationship {
                patient_agent_id: "p1".into(),
                patient_public_key: "pubkey-1".into(),
                provider_npi: "1234567893".into(),
                consented_actions: vec!["office_visit".into()],
            })
            .unwrap();

        let second = store.create(NewRelationship {
            patient_agent_id: "p1".into(),
            patient_public_key: "pubkey-1".into(),
            provider_npi: "1234567893".into(),
            consented_actions: vec!["office_visit".into()],
        });
        assert!(second.is_err());
    }

    #[test]
    fn terminated_is_terminal() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let store = store(&engine);
        let created = store
            .create(NewRelationship {
                patient_agent_id: "p1".into(),
                patient_public_key: "pubkey-1".into(),
                provider_npi: "1234567893".into(),
                consented_actions: vec!["office_visit".into()],
            })
            .unwrap();

        store.terminate(created.relationship_id, "administrative").unwrap();
        store.update_status(created.relationship_id, RelationshipStatus::Active).unwrap();

        let after = store.get(created.relationship_id).unwrap().unwrap();
        assert_eq!(after.status, RelationshipStatus::Terminated);
    }

    #[test]
    fn pagination_pages_concatenate_to_full_list() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let store = store(&engine);
        for i in 0..5 {
            store
                .create(NewRelationship {
                    patient_agent_id: format!("p{i}"),
                    patient_public_key: format!("pubkey-{i}"),
                    provider_npi: "1234567893".into(),
                    consented_actions: vec!["office_visit".into()],
                })
                .unwrap();
        }

        let page1 = store
            .list(ListFilter { status: None, limit: 2, offset: 0 })
            .unwrap();
        let page2 = store
            .list(ListFilter { status: None, limit: 2, offset: 2 })
            .unwrap();
        let page3 = store
            .list(ListFilter { status: None, limit: 2, offset: 4 })
            .unwrap();

        assert_eq!(page1.total, 5);
        assert_eq!(page1.items.len() + page2.items.len() + page3.items.len(), 5);
    }
}
