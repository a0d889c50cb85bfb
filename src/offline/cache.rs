use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::OfflineError;
use crate::clock::{duration_ms, Clock, UnixTimeMs};
use crate::storage::{DurableStore, KeyNamespace, StorageKey};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedEntry<T> {
    pub value: T,
    pub timestamp: UnixTimeMs,
}

/// Read-mostly data kept for offline use, stamped with its write time.
#[derive(Clone)]
pub struct OfflineDataCache {
    store: Arc<dyn DurableStore>,
    clock: Arc<dyn Clock>,
}

impl OfflineDataCache {
    pub fn new(store: Arc<dyn DurableStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    fn key(key: &str) -> Result<StorageKey, OfflineError> {
        Ok(StorageKey::new(KeyNamespace::OfflineData, key)?)
    }

    pub fn store<T: Serialize>(&self, key: &str, value: &T) -> Result<(), OfflineError> {
        let entry = CachedEntry {
            value,
            timestamp: self.clock.now(),
        };
        let bytes = serde_json::to_vec(&entry)?;
        self.store.set(&Self::key(key)?, &bytes)?;
        debug!(key, bytes = bytes.len(), "offline data cached");
        Ok(())
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, OfflineError> {
        Ok(self.get_entry(key)?.map(|entry| entry.value))
    }

    pub fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CachedEntry<T>>, OfflineError> {
        match self.store.get(&Self::key(key)?)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn remove(&self, key: &str) -> Result<bool, OfflineError> {
        Ok(self.store.remove(&Self::key(key)?)?)
    }

    pub fn keys(&self) -> Result<Vec<String>, OfflineError> {
        Ok(self.store.keys(&KeyNamespace::OfflineData)?)
    }

    /// Remove entries older than `max_age_hours`. Returns how many were removed.
    pub fn cleanup_old_data(&self, max_age_hours: u64) -> Result<usize, OfflineError> {
        self.cleanup_older_than(Duration::from_secs(max_age_hours.saturating_mul(3600)))
    }

    /// Unreadable entries are removed as well.
    pub fn cleanup_older_than(&self, max_age: Duration) -> Result<usize, OfflineError> {
        let now = self.clock.now();
        let max_age_ms = duration_ms(max_age);
        let mut removed = 0;

        for key in self.keys()? {
            let storage_key = Self::key(&key)?;
            let Some(bytes) = self.store.get(&storage_key)? else {
                continue;
            };
            let stale = match serde_json::from_slice::<CachedEntry<serde::de::IgnoredAny>>(&bytes) {
                Ok(entry) => now.elapsed_since(entry.timestamp) > max_age_ms,
                Err(e) => {
                    warn!(key, error = %e, "dropping unreadable offline cache entry");
                    true
                }
            };
            if stale && self.store.remove(&storage_key)? {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "old offline data cleaned up");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::RuntimeClock;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn cache() -> (OfflineDataCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(RuntimeClock::anchored_at(UnixTimeMs(1_700_000_000_000)));
        (OfflineDataCache::new(store.clone(), clock), store)
    }

    #[tokio::test(start_paused = true)]
    async fn test_store_and_get() {
        let (cache, _) = cache();
        cache.store("projects", &json!([{ "id": 1 }])).unwrap();

        let value: serde_json::Value = cache.get("projects").unwrap().unwrap();
        assert_eq!(value[0]["id"], 1);
        let entry = cache.get_entry::<serde_json::Value>("projects").unwrap().unwrap();
        assert_eq!(entry.timestamp, UnixTimeMs(1_700_000_000_000));
        assert!(cache.get::<serde_json::Value>("missing").unwrap().is_none());

        assert!(cache.remove("projects").unwrap());
        assert!(cache.keys().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_removes_only_old_entries() {
        let (cache, store) = cache();
        cache.store("old", &json!("a")).unwrap();
        tokio::time::advance(Duration::from_secs(5 * 3600)).await;
        cache.store("fresh", &json!("b")).unwrap();

        let garbage = StorageKey::new(KeyNamespace::OfflineData, "garbage").unwrap();
        store.set(&garbage, b"not json").unwrap();

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(cache.cleanup_old_data(3).unwrap(), 2);
        assert_eq!(cache.keys().unwrap(), vec!["fresh".to_string()]);
    }
}
