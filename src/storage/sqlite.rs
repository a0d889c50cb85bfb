use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::{lock, DurableStore, KeyNamespace, StorageKey, StoreError};

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// SQLite-backed store for native shells.
pub struct SqliteStore {
    conn: Mutex<Connection>,
    quota_bytes: usize,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::from_connection(Connection::open(path)?, super::DEFAULT_QUOTA_BYTES)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::from_connection(Connection::open_in_memory()?, super::DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(mut self, quota_bytes: usize) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    fn from_connection(conn: Connection, quota_bytes: usize) -> Result<Self, StoreError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv_entries (
                key TEXT PRIMARY KEY,
                value BLOB NOT NULL,
                updated_at INTEGER NOT NULL DEFAULT (strftime('%s','now'))
            );
            "#,
        )?;
        debug!("sqlite store ready");
        Ok(Self {
            conn: Mutex::new(conn),
            quota_bytes,
        })
    }

    fn used_bytes_excluding(conn: &Connection, raw_key: &str) -> Result<usize, StoreError> {
        let used: i64 = conn.query_row(
            "SELECT COALESCE(SUM(LENGTH(key) + LENGTH(value)), 0) FROM kv_entries WHERE key != ?1",
            params![raw_key],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(used).unwrap_or(usize::MAX))
    }
}

impl DurableStore for SqliteStore {
    fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        let conn = lock(&self.conn);
        let value = conn
            .query_row(
                "SELECT value FROM kv_entries WHERE key = ?1",
                params![key.raw()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError> {
        let raw = key.raw();
        let conn = lock(&self.conn);
        let used = Self::used_bytes_excluding(&conn, &raw)? + raw.len() + value.len();
        if used > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                used,
                limit: self.quota_bytes,
            });
        }
        conn.execute(
            r#"
            INSERT INTO kv_entries (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = strftime('%s','now')
            "#,
            params![raw, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &StorageKey) -> Result<bool, StoreError> {
        let conn = lock(&self.conn);
        let affected = conn.execute("DELETE FROM kv_entries WHERE key = ?1", params![key.raw()])?;
        Ok(affected > 0)
    }

    fn keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, StoreError> {
        let prefix = StorageKey::namespace_prefix(namespace);
        let conn = lock(&self.conn);
        let mut stmt = conn.prepare("SELECT key FROM kv_entries WHERE substr(key, 1, ?2) = ?1 ORDER BY key")?;
        let prefix_len = i64::try_from(prefix.len()).unwrap_or(i64::MAX);
        let rows = stmt.query_map(params![prefix, prefix_len], |row| row.get::<_, String>(0))?;

        let mut keys = Vec::new();
        for raw in rows {
            let raw = raw?;
            if let Some(stripped) = raw.strip_prefix(prefix.as_str()) {
                keys.push(stripped.to_string());
            }
        }
        Ok(keys)
    }
}
