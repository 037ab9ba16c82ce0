//! Main store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use rusqlite::{Connection, OptionalExtension};
use time::OffsetDateTime;
use tracing::{debug, info};

use waypost_types::{KeyValueStore, StorageResult};

use crate::error::{Error, Result};
use crate::models::StoredEntry;
use crate::schema;

/// SQLite-based durable store for tracking engine state.
///
/// Every `set` and `delete` is committed before returning, so a value the
/// engine has written survives a process restart.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl SqliteStore {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = FULL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Read the value stored under `key`.
    pub fn read(&self, key: &str) -> Result<Option<Bytes>> {
        let value = self
            .conn()
            .query_row("SELECT value FROM kv WHERE key = ?", [key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value.map(Bytes::from))
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn write(&self, key: &str, value: &[u8]) -> Result<()> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        self.conn().execute(
            "INSERT INTO kv (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            rusqlite::params![key, value, now],
        )?;
        debug!("Stored {} bytes under {}", value.len(), key);
        Ok(())
    }

    /// Remove `key`. Returns `true` if it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let removed = self.conn().execute("DELETE FROM kv WHERE key = ?", [key])?;
        Ok(removed > 0)
    }

    /// All stored keys in order.
    pub fn keys(&self) -> Result<Vec<String>> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    /// Key, size, and write time of every stored value.
    pub fn entries(&self) -> Result<Vec<StoredEntry>> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare("SELECT key, length(value), updated_at FROM kv ORDER BY key")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(key, size, updated_at)| StoredEntry {
                key,
                size: usize::try_from(size).unwrap_or_default(),
                updated_at: OffsetDateTime::from_unix_timestamp(updated_at)
                    .unwrap_or(OffsetDateTime::UNIX_EPOCH),
            })
            .collect())
    }

    /// Delete every stored value.
    pub fn clear(&self) -> Result<usize> {
        let removed = self.conn().execute("DELETE FROM kv", [])?;
        info!("Cleared {} stored values", removed);
        Ok(removed)
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> StorageResult<Option<Bytes>> {
        Ok(self.read(key)?)
    }

    fn set(&self, key: &str, value: Bytes) -> StorageResult<()> {
        Ok(self.write(key, &value)?)
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        self.remove(key)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_get_set_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get("waypost.session").unwrap().is_none());

        store
            .set("waypost.session", Bytes::from_static(b"{\"state\":\"stopped\"}"))
            .unwrap();
        assert_eq!(
            store.get("waypost.session").unwrap().unwrap(),
            Bytes::from_static(b"{\"state\":\"stopped\"}")
        );

        store.set("waypost.session", Bytes::from_static(b"{}")).unwrap();
        assert_eq!(
            store.get("waypost.session").unwrap().unwrap(),
            Bytes::from_static(b"{}")
        );

        store.delete("waypost.session").unwrap();
        assert!(store.get("waypost.session").unwrap().is_none());
        // deleting a missing key is fine
        store.delete("waypost.session").unwrap();
    }

    #[test]
    fn test_entries_report_sizes() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.write("b", b"12345").unwrap();
        store.write("a", b"").unwrap();

        let entries = store.entries().unwrap();
        let summary: Vec<_> = entries.iter().map(|e| (e.key.as_str(), e.size)).collect();
        assert_eq!(summary, vec![("a", 0), ("b", 5)]);
        assert_eq!(store.clear().unwrap(), 2);
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("waypost.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.write("waypost.replay", b"[1,2,3]").unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(
            store.read("waypost.replay").unwrap().unwrap(),
            Bytes::from_static(b"[1,2,3]")
        );
    }
}
