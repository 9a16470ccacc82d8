use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};

#[derive(Debug, Clone, PartialEq, Eq)]
/// One cached value with its stale-while-revalidate expiry window.
pub struct StoredEntry {
    pub value: String,
    pub soft_expires_at: u64,
    pub hard_expires_at: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("cache store unavailable: {0}")]
    Unavailable(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Backing key-value store for the cache substrate. Implementations expose
/// the Redis-shaped operation set the substrate consumes: get, set, delete,
/// prefix-scan, and a liveness probe.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError>;
    fn set(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;
    fn ping(&self) -> Result<(), StoreError>;
    /// Whether entries survive the process. Bulk manifests require this.
    fn is_durable(&self) -> bool;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, StoredEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, StoredEntry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                crate::logging::warn("recovering poisoned mutex: memory cache store");
                poisoned.into_inner()
            }
        }
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let now = unix_now();
        let mut entries = self.lock();
        match entries.get(key) {
            Some(entry) if entry.hard_expires_at > now => Ok(Some(entry.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn set(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        self.lock().insert(key.to_string(), entry);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock().remove(key);
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .lock()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn is_durable(&self) -> bool {
        false
    }
}

#[derive(Debug)]
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
CREATE TABLE IF NOT EXISTS jml_cache (
  key TEXT PRIMARY KEY,
  value TEXT NOT NULL,
  soft_expires_at INTEGER NOT NULL,
  hard_expires_at INTEGER NOT NULL
);
",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                crate::logging::warn("recovering poisoned mutex: sqlite cache store");
                poisoned.into_inner()
            }
        }
    }
}

impl CacheStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<StoredEntry>, StoreError> {
        let now = unix_now();
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT value, soft_expires_at, hard_expires_at FROM jml_cache WHERE key = ?1",
        )?;
        let mut rows = stmt.query(params![key])?;

        if let Some(row) = rows.next()? {
            let entry = StoredEntry {
                value: row.get(0)?,
                soft_expires_at: row.get::<_, i64>(1)? as u64,
                hard_expires_at: row.get::<_, i64>(2)? as u64,
            };
            drop(rows);
            drop(stmt);
            if entry.hard_expires_at <= now {
                conn.execute("DELETE FROM jml_cache WHERE key = ?1", params![key])?;
                return Ok(None);
            }
            return Ok(Some(entry));
        }

        Ok(None)
    }

    fn set(&self, key: &str, entry: StoredEntry) -> Result<(), StoreError> {
        self.lock().execute(
            "
INSERT INTO jml_cache(key, value, soft_expires_at, hard_expires_at)
VALUES (?1, ?2, ?3, ?4)
ON CONFLICT(key) DO UPDATE SET
  value = excluded.value,
  soft_expires_at = excluded.soft_expires_at,
  hard_expires_at = excluded.hard_expires_at
",
            params![
                key,
                entry.value,
                entry.soft_expires_at as i64,
                entry.hard_expires_at as i64
            ],
        )?;
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.lock()
            .execute("DELETE FROM jml_cache WHERE key = ?1", params![key])?;
        Ok(())
    }

    fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let pattern = format!("{}%", prefix.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt =
            conn.prepare("SELECT key FROM jml_cache WHERE key LIKE ?1 ESCAPE '\\'")?;
        let keys = stmt
            .query_map(params![pattern], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }

    fn ping(&self) -> Result<(), StoreError> {
        self.lock()
            .query_row("SELECT 1", [], |_| Ok(()))
            .map_err(StoreError::from)
    }

    fn is_durable(&self) -> bool {
        true
    }
}
