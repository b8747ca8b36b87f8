//! Versioned migrations, applied in ascending order and recorded in a
//! `migrations` table. Migrations are additive only; there is no down
//! migration.

use rusqlite::Connection;

use crate::error::StorageError;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: r#"
            CREATE TABLE IF NOT EXISTS migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS relationships (
                relationship_id TEXT PRIMARY KEY,
                patient_agent_id TEXT NOT NULL,
                patient_public_key TEXT NOT NULL,
                provider_npi TEXT NOT NULL,
                status TEXT NOT NULL,
                consented_actions TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_relationships_active_pair
                ON relationships (patient_public_key, provider_npi)
                WHERE status <> 'terminated';

            CREATE INDEX IF NOT EXISTS idx_relationships_status
                ON relationships (status);

            CREATE TABLE IF NOT EXISTS neuron_registration (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                organization_npi TEXT NOT NULL,
                organization_name TEXT NOT NULL,
                organization_type TEXT NOT NULL,
                registry_url TEXT NOT NULL,
                endpoint_url TEXT NOT NULL,
                registration_id TEXT,
                bearer_token TEXT,
                status TEXT NOT NULL,
                first_registered_at TEXT,
                last_heartbeat_at TEXT,
                last_response_at TEXT
            );

            CREATE TABLE IF NOT EXISTS provider_registrations (
                provider_npi TEXT PRIMARY KEY,
                provider_name TEXT,
                provider_types TEXT,
                specialty TEXT,
                directory_id TEXT,
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS api_keys (
                key_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                key_hash TEXT NOT NULL,
                permission_level TEXT NOT NULL,
                created_at TEXT NOT NULL,
                revoked_at TEXT,
                last_used_at TEXT
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_api_keys_hash ON api_keys (key_hash);
        "#,
    },
];

pub(crate) fn migrate(conn: &Connection) -> Result<(), StorageError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migrations (version INTEGER PRIMARY KEY, applied_at TEXT NOT NULL);",
    )?;

    let current: i32 = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM migrations", [], |row| row.get(0))
        .unwrap_or(0);

    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        conn.execute_batch(migration.sql).map_err(|e| {
            StorageError::Migration(migration.version, e.to_string())
        })?;
        conn.execute(
            "INSERT INTO migrations (version, applied_at) VALUES (?1, ?2)",
            rusqlite::params![migration.version, chrono::Utc::now().to_rfc3339()],
        )?;
    }

    Ok(())
}
