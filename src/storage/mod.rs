//! Embedded SQL storage engine.
//!
//! A single [`rusqlite::Connection`] behind a `Mutex` serializes writers;
//! WAL mode lets readers proceed concurrently against the same file.
//! Migrations are additive, numbered, and recorded in a `migrations`
//! table so a restart never reapplies one.

mod schema;

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, Row};

use crate::error::StorageError;

/// The result of a write statement.
pub struct ExecResult {
    pub changes: usize,
    pub last_insert_id: i64,
}

pub struct StorageEngine {
    conn: Mutex<Connection>,
    path: std::path::PathBuf,
}

impl StorageEngine {
    /// Opens (creating if absent) the database at `path`, applies
    /// migrations in ascending order, and returns the ready engine.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    /// Opens an in-memory database, for tests.
    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: std::path::PathBuf::new(),
        })
    }

    /// The directory containing the database file, used to derive the IPC
    /// socket path. Empty for in-memory engines.
    pub fn data_dir(&self) -> std::path::PathBuf {
        self.path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default()
    }

    /// Executes a write statement, returning rows changed and the last
    /// inserted rowid.
    pub fn run(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<ExecResult, StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(sql, params)?;
        Ok(ExecResult {
            changes: conn.changes() as usize,
            last_insert_id: conn.last_insert_rowid(),
        })
    }

    /// Executes a query expected to return at most one row.
    pub fn get<T>(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        map: impl FnOnce(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Option<T>, StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(sql)?;
        Ok(stmt.query_row(params, map).optional()?)
    }

    /// Executes a query and collects every row.
    pub fn all<T>(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        mut map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
    ) -> Result<Vec<T>, StorageError> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, &mut map)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Runs `body` inside a transaction, committing on `Ok` and rolling
    /// back on `Err`.
    pub fn transaction<T>(
        &self,
        body: impl FnOnce(&rusqlite::Transaction<'_>) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut conn = self.conn.lock().expect("storage mutex poisoned");
        let tx = conn.transaction()?;
        let result = body(&tx)?;
        tx.commit()?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migrations_apply_and_are_idempotent_across_reopen() {
        let engine = StorageEngine::open_in_memory().unwrap();
        let version: i64 = engine
            .get(
                "SELECT MAX(version) FROM migrations",
                &[],
                |row| row.get(0),
            )
            .unwrap()
            .unwrap();
        assert!(version >= 1);
    }
}
