use rusqlite::Connection;
use std::path::Path;

use super::{schema, StoreError};

/// Manages unified storage for the proxy: service records, user env
/// overrides, access tokens, request statistics, and rate-limit counters.
///
/// Shared across tasks as `Arc<std::sync::RwLock<MainStore>>`; rusqlite
/// statements are short-lived, so the lock is never held across an await
/// point.
pub struct MainStore {
    pub(crate) conn: std::sync::Mutex<Connection>,
}

impl MainStore {
    /// Opens (or creates) the database at `path` and initializes the schema.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        schema::init(&conn)?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    /// Opens an in-memory store. Used by tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        schema::init(&conn)?;
        Ok(Self {
            conn: std::sync::Mutex::new(conn),
        })
    }

    /// Locks and returns the underlying connection. rusqlite's statement
    /// cache is not `Sync`, so `MainStore` is shared behind an outer
    /// `RwLock` read lock plus this inner `Mutex` to serialize actual
    /// connection access across threads.
    pub(crate) fn conn(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("main store connection lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_database_file_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("one-mcp.db");
        let store = MainStore::new(&path).expect("open store");
        assert!(path.exists());

        // Schema is usable immediately.
        let count: i64 = store
            .conn()
            .query_row("SELECT COUNT(*) FROM services", [], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);

        // Re-opening an existing database is fine.
        drop(store);
        MainStore::new(&path).expect("reopen store");
    }
}
