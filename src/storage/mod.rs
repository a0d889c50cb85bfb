//! Durable local key/value persistence.
//!
//! The store is synchronous on purpose: every queue mutation is persisted
//! before the mutating call returns. Implementations are bounded in size,
//! the way browser profile storage is.

mod file;
#[cfg(not(target_arch = "wasm32"))]
mod sqlite;

pub use self::file::FileStore;
#[cfg(not(target_arch = "wasm32"))]
pub use self::sqlite::SqliteStore;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

use crate::error::{CoreError, ErrorKind};
use crate::lock;

pub const MAX_KEY_LENGTH: usize = 512;
pub const MAX_PREFIX_LENGTH: usize = 64;
pub const DEFAULT_QUOTA_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("quota exceeded: {used}/{limit} bytes")]
    QuotaExceeded { used: usize, limit: usize },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupted store: {reason}")]
    Corrupted { reason: &'static str },

    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    #[error("schema version {found} is newer than supported {max}")]
    FutureSchema { found: u32, max: u32 },

    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Io(_) | StoreError::Backend(_))
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        let kind = match &e {
            StoreError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            StoreError::InvalidKey { .. } => ErrorKind::Validation,
            StoreError::Serialization(_) => ErrorKind::Serialization,
            _ => ErrorKind::Storage,
        };
        CoreError::new(kind, e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyNamespace {
    OfflineQueue,
    OfflineData,
    Session,
    Health,
    Custom(String),
}

impl KeyNamespace {
    pub fn prefix(&self) -> &str {
        match self {
            KeyNamespace::OfflineQueue => "offline_queue",
            KeyNamespace::OfflineData => "offline_data",
            KeyNamespace::Session => "session",
            KeyNamespace::Health => "health",
            KeyNamespace::Custom(s) => s.as_str(),
        }
    }

    pub fn custom(prefix: impl Into<String>) -> Result<Self, StoreError> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: "custom namespace cannot be empty".to_string(),
            });
        }
        if prefix.len() > MAX_PREFIX_LENGTH {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: format!(
                    "custom namespace exceeds maximum length of {} bytes",
                    MAX_PREFIX_LENGTH
                ),
            });
        }
        if !prefix
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(StoreError::InvalidKey {
                key: prefix,
                reason: "custom namespace contains invalid characters".to_string(),
            });
        }
        Ok(KeyNamespace::Custom(prefix))
    }
}

/// Namespaced, validated storage key. Its raw form is `"<namespace>:<key>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageKey {
    namespace: KeyNamespace,
    key: String,
}

impl StorageKey {
    pub fn new(namespace: KeyNamespace, key: impl Into<String>) -> Result<Self, StoreError> {
        let key = key.into();
        Self::validate_key(&key)?;
        Ok(Self { namespace, key })
    }

    pub fn raw(&self) -> String {
        format!("{}:{}", self.namespace.prefix(), self.key)
    }

    /// Prefix shared by every raw key of `namespace`.
    pub fn namespace_prefix(namespace: &KeyNamespace) -> String {
        format!("{}:", namespace.prefix())
    }

    pub fn namespace(&self) -> &KeyNamespace {
        &self.namespace
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    fn validate_key(key: &str) -> Result<(), StoreError> {
        if key.trim().is_empty() {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot be empty".to_string(),
            });
        }

        if key.len() > MAX_KEY_LENGTH {
            return Err(StoreError::InvalidKey {
                key: key.chars().take(50).collect::<String>() + "...",
                reason: format!("key exceeds maximum length of {} bytes", MAX_KEY_LENGTH),
            });
        }

        if key.contains("..") {
            return Err(StoreError::InvalidKey {
                key: key.to_string(),
                reason: "key cannot contain path traversal sequences".to_string(),
            });
        }

        if key.chars().any(|c| c.is_control()) {
            return Err(StoreError::InvalidKey {
                key: key.replace('\0', "\\0"),
                reason: "key contains control characters".to_string(),
            });
        }

        Ok(())
    }
}

/// Synchronous, size-bounded key/value persistence scoped to one profile.
pub trait DurableStore: Send + Sync {
    fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError>;
    fn remove(&self, key: &StorageKey) -> Result<bool, StoreError>;
    /// Keys (without namespace prefix) currently stored under `namespace`.
    fn keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, StoreError>;
}

pub(crate) fn keys_in_namespace<'a>(
    raw_keys: impl Iterator<Item = &'a String>,
    namespace: &KeyNamespace,
) -> Vec<String> {
    let prefix = StorageKey::namespace_prefix(namespace);
    let mut keys: Vec<String> = raw_keys
        .filter_map(|raw| raw.strip_prefix(prefix.as_str()).map(str::to_string))
        .collect();
    keys.sort();
    keys
}

pub(crate) fn entry_size(raw_key: &str, value: &[u8]) -> usize {
    raw_key.len() + value.len()
}

/// Quota-enforcing in-memory store; state does not survive the process.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
    quota_bytes: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_quota(DEFAULT_QUOTA_BYTES)
    }

    pub fn with_quota(quota_bytes: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            quota_bytes,
        }
    }

    pub fn used_bytes(&self) -> usize {
        lock(&self.entries)
            .iter()
            .map(|(k, v)| entry_size(k, v))
            .sum()
    }
}

impl DurableStore for MemoryStore {
    fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(lock(&self.entries).get(&key.raw()).cloned())
    }

    fn set(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError> {
        let raw = key.raw();
        let mut entries = lock(&self.entries);
        let current: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        let replaced = entries.get(&raw).map_or(0, |v| entry_size(&raw, v));
        let used = current - replaced + entry_size(&raw, value);
        if used > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                used,
                limit: self.quota_bytes,
            });
        }
        entries.insert(raw, value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &StorageKey) -> Result<bool, StoreError> {
        Ok(lock(&self.entries).remove(&key.raw()).is_some())
    }

    fn keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, StoreError> {
        Ok(keys_in_namespace(lock(&self.entries).keys(), namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation_empty() {
        let result = StorageKey::new(KeyNamespace::OfflineData, "");
        assert!(matches!(result, Err(StoreError::InvalidKey { .. })));
        assert!(StorageKey::new(KeyNamespace::OfflineData, "   ").is_err());
    }

    #[test]
    fn test_key_validation_rejects_control_and_traversal() {
        assert!(StorageKey::new(KeyNamespace::OfflineData, "key\0value").is_err());
        assert!(StorageKey::new(KeyNamespace::OfflineData, "key\x01value").is_err());
        assert!(StorageKey::new(KeyNamespace::OfflineData, "../etc/passwd").is_err());
        assert!(StorageKey::new(KeyNamespace::OfflineData, "a".repeat(MAX_KEY_LENGTH + 1)).is_err());
    }

    #[test]
    fn test_key_raw_form() {
        let key = StorageKey::new(KeyNamespace::OfflineQueue, "default").unwrap();
        assert_eq!(key.raw(), "offline_queue:default");
    }

    #[test]
    fn test_custom_namespace() {
        assert_eq!(KeyNamespace::custom("tenant-7").unwrap().prefix(), "tenant-7");
        assert!(KeyNamespace::custom("").is_err());
        assert!(KeyNamespace::custom("bad namespace!").is_err());
    }

    #[test]
    fn test_memory_store_roundtrip_and_keys() {
        let store = MemoryStore::new();
        let a = StorageKey::new(KeyNamespace::OfflineData, "projects").unwrap();
        let b = StorageKey::new(KeyNamespace::OfflineData, "members").unwrap();
        let other = StorageKey::new(KeyNamespace::Session, "projects").unwrap();

        store.set(&a, b"[1,2]").unwrap();
        store.set(&b, b"[]").unwrap();
        store.set(&other, b"x").unwrap();

        assert_eq!(store.get(&a).unwrap().as_deref(), Some(&b"[1,2]"[..]));
        assert_eq!(
            store.keys(&KeyNamespace::OfflineData).unwrap(),
            vec!["members".to_string(), "projects".to_string()]
        );

        assert!(store.remove(&a).unwrap());
        assert!(!store.remove(&a).unwrap());
        assert!(store.get(&a).unwrap().is_none());
    }

    #[test]
    fn test_memory_store_enforces_quota() {
        let store = MemoryStore::with_quota(64);
        let key = StorageKey::new(KeyNamespace::OfflineData, "blob").unwrap();

        store.set(&key, &[0u8; 32]).unwrap();
        let result = store.set(&key, &[0u8; 80]);
        assert!(matches!(result, Err(StoreError::QuotaExceeded { limit: 64, .. })));

        // Replacing an entry only counts the new value once.
        store.set(&key, &[0u8; 40]).unwrap();
        assert_eq!(store.used_bytes(), "offline_data:blob".len() + 40);
    }

    #[test]
    fn test_store_error_maps_to_core_error() {
        let core: CoreError = StoreError::QuotaExceeded { used: 10, limit: 5 }.into();
        assert_eq!(core.kind, ErrorKind::QuotaExceeded);
        assert!(!core.is_retryable());
    }
}
