//! Versioned key-value store.
//!
//! Every key carries a version that the store bumps on each write. Writes
//! and deletes name the version they expect; a mismatch is a conflict and
//! nothing is changed. Version 0 means "must not exist yet".

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::debug;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {key} was modified concurrently (expected version {expected}, found {actual})")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("gave up on {key} after {attempts} conflicting attempts")]
    RetriesExhausted { key: String, attempts: u32 },

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("record codec error: {0}")]
    Codec(String),
}

impl StoreError {
    /// Another writer got there first; retrying with a fresh version may work.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    /// The backend itself failed; retrying will not help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Sqlite(_) | Self::Codec(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}

/// A stored value with its current version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub version: u64,
}

/// Versioned key-value store with compare-and-swap semantics.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Fetch a key.
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError>;

    /// Write `value` if the key is at `expected` (0 = absent).
    ///
    /// Returns the new version.
    async fn put_atomic(&self, key: &str, value: &str, expected: u64) -> Result<u64, StoreError>;

    /// Delete the key if it is at `expected`.
    async fn delete_atomic(&self, key: &str, expected: u64) -> Result<(), StoreError>;

    /// All entries whose key starts with `prefix`, ordered by key.
    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError>;
}

/// SQLite-backed store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                version INTEGER NOT NULL
            );
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn current_version(conn: &Connection, key: &str) -> Result<Option<u64>, StoreError> {
    let version: Option<i64> = conn
        .query_row(
            "SELECT version FROM kv WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version.map(|v| v as u64))
}

#[async_trait]
impl KvStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        let conn = self.conn();
        conn.query_row(
            "SELECT key, value, version FROM kv WHERE key = ?1",
            params![key],
            |row| {
                Ok(KvEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    version: row.get::<_, i64>(2)? as u64,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    async fn put_atomic(&self, key: &str, value: &str, expected: u64) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        let next = match current_version(&tx, key)? {
            None if expected == 0 => {
                tx.execute(
                    "INSERT INTO kv (key, value, version) VALUES (?1, ?2, 1)",
                    params![key, value],
                )?;
                1
            }
            Some(actual) if actual == expected => {
                let next = actual + 1;
                tx.execute(
                    "UPDATE kv SET value = ?1, version = ?2 WHERE key = ?3",
                    params![value, next as i64, key],
                )?;
                next
            }
            actual => {
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected,
                    actual: actual.unwrap_or(0),
                })
            }
        };

        tx.commit()?;
        Ok(next)
    }

    async fn delete_atomic(&self, key: &str, expected: u64) -> Result<(), StoreError> {
        let mut conn = self.conn();
        let tx = conn.transaction()?;

        match current_version(&tx, key)? {
            None => return Err(StoreError::NotFound(key.to_string())),
            Some(actual) if actual != expected => {
                return Err(StoreError::Conflict {
                    key: key.to_string(),
                    expected,
                    actual,
                })
            }
            Some(_) => {
                tx.execute("DELETE FROM kv WHERE key = ?1", params![key])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT key, value, version FROM kv
             WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
        )?;

        let entries = stmt
            .query_map(params![prefix], |row| {
                Ok(KvEntry {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    version: row.get::<_, i64>(2)? as u64,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sqlite_put_and_get() {
        let store = SqliteStore::open_in_memory().unwrap();

        let v1 = store.put_atomic("a/1", "one", 0).await.unwrap();
        assert_eq!(v1, 1);

        let entry = store.get("a/1").await.unwrap().unwrap();
        assert_eq!(entry.value, "one");
        assert_eq!(entry.version, 1);

        let v2 = store.put_atomic("a/1", "uno", 1).await.unwrap();
        assert_eq!(v2, 2);
        assert_eq!(store.get("a/1").await.unwrap().unwrap().value, "uno");

        assert!(store.get("a/2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_put_conflicts() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_atomic("a/1", "one", 0).await.unwrap();

        // already exists
        let err = store.put_atomic("a/1", "again", 0).await.unwrap_err();
        assert!(err.is_conflict());

        // stale version
        store.put_atomic("a/1", "two", 1).await.unwrap();
        let err = store.put_atomic("a/1", "three", 1).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::Conflict {
                expected: 1,
                actual: 2,
                ..
            }
        ));

        // missing key with a version
        let err = store.put_atomic("a/9", "x", 3).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_sqlite_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_atomic("a/1", "one", 0).await.unwrap();

        let err = store.delete_atomic("a/1", 7).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!err.is_fatal());

        store.delete_atomic("a/1", 1).await.unwrap();
        assert!(store.get("a/1").await.unwrap().is_none());

        let err = store.delete_atomic("a/1", 1).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sqlite_list_by_prefix() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.put_atomic("net/b", "2", 0).await.unwrap();
        store.put_atomic("net/a", "1", 0).await.unwrap();
        store.put_atomic("ep/a", "x", 0).await.unwrap();
        store.put_atomic("net_other/a", "y", 0).await.unwrap();

        let keys: Vec<String> = store
            .list("net/")
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.key)
            .collect();
        assert_eq!(keys, vec!["net/a".to_string(), "net/b".to_string()]);
    }

    #[tokio::test]
    async fn test_sqlite_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            store.put_atomic("a/1", "one", 0).await.unwrap();
        }

        let store = SqliteStore::open(&path).unwrap();
        let entry = store.get("a/1").await.unwrap().unwrap();
        assert_eq!(entry.value, "one");
        assert_eq!(entry.version, 1);
    }
}
