use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{entry_size, keys_in_namespace, lock, DurableStore, KeyNamespace, StorageKey, StoreError};

const CURRENT_SCHEMA_VERSION: u32 = 1;
const STORE_MAGIC: &[u8; 4] = b"RCST";

impl From<ciborium::de::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for StoreError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Serialize, Deserialize, Debug)]
struct StoreEnvelope {
    magic: [u8; 4],
    schema_version: u32,
    checksum: [u8; 32],
    payload: Vec<u8>,
}

/// Single-file store. The whole map lives in memory and every write
/// replaces the file atomically (temp file, fsync, rename).
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    quota_bytes: usize,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl FileStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        Self::open_with_quota(path, super::DEFAULT_QUOTA_BYTES)
    }

    pub fn open_with_quota(path: impl Into<PathBuf>, quota_bytes: usize) -> Result<Self, StoreError> {
        let path = path.into();
        let entries = if path.exists() {
            let bytes = std::fs::read(&path)?;
            if bytes.is_empty() {
                return Err(StoreError::Corrupted { reason: "empty file" });
            }
            decode(&bytes, quota_bytes)?
        } else {
            BTreeMap::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "file store opened");

        Ok(Self {
            path,
            quota_bytes,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let bytes = encode(entries)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = File::create(&tmp_path)?;
        file.write_all(&bytes)?;
        file.sync_all()?;

        std::fs::rename(&tmp_path, &self.path)?;

        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }

    fn check_quota(&self, entries: &BTreeMap<String, Vec<u8>>) -> Result<(), StoreError> {
        let used: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
        if used > self.quota_bytes {
            return Err(StoreError::QuotaExceeded {
                used,
                limit: self.quota_bytes,
            });
        }
        Ok(())
    }
}

impl DurableStore for FileStore {
    fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(lock(&self.entries).get(&key.raw()).cloned())
    }

    fn set(&self, key: &StorageKey, value: &[u8]) -> Result<(), StoreError> {
        let mut entries = lock(&self.entries);
        let mut next = entries.clone();
        next.insert(key.raw(), value.to_vec());
        self.check_quota(&next)?;
        self.persist(&next)?;
        *entries = next;
        Ok(())
    }

    fn remove(&self, key: &StorageKey) -> Result<bool, StoreError> {
        let mut entries = lock(&self.entries);
        let raw = key.raw();
        if !entries.contains_key(&raw) {
            return Ok(false);
        }
        let mut next = entries.clone();
        next.remove(&raw);
        self.persist(&next)?;
        *entries = next;
        Ok(true)
    }

    fn keys(&self, namespace: &KeyNamespace) -> Result<Vec<String>, StoreError> {
        Ok(keys_in_namespace(lock(&self.entries).keys(), namespace))
    }
}

fn encode(entries: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, StoreError> {
    let mut payload = Vec::new();
    ciborium::into_writer(entries, &mut payload)?;

    let checksum = blake3::hash(&payload);
    let envelope = StoreEnvelope {
        magic: *STORE_MAGIC,
        schema_version: CURRENT_SCHEMA_VERSION,
        checksum: *checksum.as_bytes(),
        payload,
    };

    let mut bytes = Vec::new();
    ciborium::into_writer(&envelope, &mut bytes)?;
    Ok(bytes)
}

fn decode(bytes: &[u8], quota_bytes: usize) -> Result<BTreeMap<String, Vec<u8>>, StoreError> {
    let envelope: StoreEnvelope = ciborium::from_reader(bytes)?;

    if envelope.magic != *STORE_MAGIC {
        return Err(StoreError::Corrupted {
            reason: "invalid magic bytes",
        });
    }

    if envelope.schema_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::FutureSchema {
            found: envelope.schema_version,
            max: CURRENT_SCHEMA_VERSION,
        });
    }

    let actual = blake3::hash(&envelope.payload);
    if actual.as_bytes() != &envelope.checksum {
        return Err(StoreError::IntegrityCheckFailed {
            expected: hex::encode(envelope.checksum),
            actual: hex::encode(actual.as_bytes()),
        });
    }

    let entries: BTreeMap<String, Vec<u8>> = ciborium::from_reader(&envelope.payload[..])?;
    let used: usize = entries.iter().map(|(k, v)| entry_size(k, v)).sum();
    if used > quota_bytes {
        warn!(used, quota_bytes, "persisted store exceeds quota; writes will fail until entries are removed");
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(name: &str) -> StorageKey {
        StorageKey::new(KeyNamespace::OfflineQueue, name).unwrap()
    }

    #[test]
    fn test_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        {
            let store = FileStore::open(&path).unwrap();
            store.set(&key("default"), b"[1,2,3]").unwrap();
            store.set(&key("other"), b"[]").unwrap();
            assert!(store.remove(&key("other")).unwrap());
        }

        let reopened = FileStore::open(&path).unwrap();
        assert_eq!(reopened.get(&key("default")).unwrap().as_deref(), Some(&b"[1,2,3]"[..]));
        assert!(reopened.get(&key("other")).unwrap().is_none());
        assert_eq!(reopened.keys(&KeyNamespace::OfflineQueue).unwrap(), vec!["default"]);
    }

    #[test]
    fn test_tampered_file_fails_integrity_check() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        let mut entries = BTreeMap::new();
        entries.insert("offline_queue:default".to_string(), b"payload".to_vec());
        let mut payload = Vec::new();
        ciborium::into_writer(&entries, &mut payload).unwrap();
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION,
            checksum: [0u8; 32],
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        std::fs::write(&path, bytes).unwrap();

        let result = FileStore::open(&path);
        assert!(matches!(result, Err(StoreError::IntegrityCheckFailed { .. })));
    }

    #[test]
    fn test_future_schema_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");

        let payload = Vec::new();
        let envelope = StoreEnvelope {
            magic: *STORE_MAGIC,
            schema_version: CURRENT_SCHEMA_VERSION + 1,
            checksum: *blake3::hash(&payload).as_bytes(),
            payload,
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&envelope, &mut bytes).unwrap();
        std::fs::write(&path, bytes).unwrap();

        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::FutureSchema { .. })
        ));
    }

    #[test]
    fn test_empty_file_is_corrupted() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.bin");
        std::fs::write(&path, b"").unwrap();

        assert!(matches!(
            FileStore::open(&path),
            Err(StoreError::Corrupted { .. })
        ));
    }

    #[test]
    fn test_quota_rejects_without_mutating() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open_with_quota(dir.path().join("store.bin"), 48).unwrap();

        store.set(&key("a"), &[1u8; 8]).unwrap();
        let result = store.set(&key("b"), &[1u8; 64]);
        assert!(matches!(result, Err(StoreError::QuotaExceeded { .. })));
        assert!(store.get(&key("b")).unwrap().is_none());
        assert!(store.get(&key("a")).unwrap().is_some());
    }
}
