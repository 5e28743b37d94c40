//! Bridge between one cache namespace and a durable store.
//!
//! Entries are written as JSON under their full (namespace-prefixed) cache
//! key. On startup the bridge rehydrates every record of its namespace,
//! discarding records that are malformed or already past the stale window.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cache::entry::CacheEntry;
use crate::cache::freshness::{Freshness, FreshnessPolicy};
use crate::config::NAMESPACE_SEPARATOR;
use crate::persist::storage::{DurableStore, PersistenceError};

/// Result of rehydrating a namespace.
#[derive(Debug)]
pub struct Rehydrated<T> {
    /// Surviving entries, oldest first.
    pub entries: Vec<(String, CacheEntry<T>)>,
    /// Records dropped for being past the stale window.
    pub expired: usize,
    /// Records dropped because they could not be decoded.
    pub malformed: usize,
}

/// Only the timestamp is needed to decide whether a record is expired.
#[derive(Deserialize)]
struct RecordHeader {
    stored_at: u64,
}

pub struct PersistenceBridge {
    store: Arc<dyn DurableStore>,
    prefix: String,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn DurableStore>, namespace: &str) -> Self {
        Self {
            store,
            prefix: format!("{namespace}{NAMESPACE_SEPARATOR}"),
        }
    }

    /// Prefix shared by every key of this namespace.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn write<T: Serialize>(&self, key: &str, entry: &CacheEntry<T>) -> Result<(), PersistenceError> {
        let record = serde_json::to_string(entry)?;
        self.store.set(key, &record)?;
        debug!(key, bytes = record.len(), "Persisted entry");
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Result<(), PersistenceError> {
        self.store.remove(key)
    }

    /// All durable keys of this namespace.
    pub fn keys(&self) -> Result<Vec<String>, PersistenceError> {
        Ok(self
            .store
            .keys()?
            .into_iter()
            .filter(|k| k.starts_with(&self.prefix))
            .collect())
    }

    /// Load every live record of this namespace, purging dead ones.
    pub fn load<T: DeserializeOwned>(
        &self,
        policy: &FreshnessPolicy,
        now: u64,
    ) -> Result<Rehydrated<T>, PersistenceError> {
        let mut rehydrated = Rehydrated {
            entries: Vec::new(),
            expired: 0,
            malformed: 0,
        };

        for key in self.keys()? {
            let decoded = match self.store.get(&key) {
                Ok(Some(record)) => serde_json::from_str::<CacheEntry<T>>(&record).map_err(|e| {
                    PersistenceError::Malformed {
                        key: key.clone(),
                        reason: e.to_string(),
                    }
                }),
                // Vanished between enumeration and read.
                Ok(None) => continue,
                Err(e) => Err(e),
            };

            match decoded {
                Ok(entry) if policy.is_expired(&entry, now) => {
                    rehydrated.expired += 1;
                    self.remove_logged(&key);
                }
                Ok(entry) => rehydrated.entries.push((key, entry)),
                Err(e) => {
                    debug!(error = %e, "Discarding unreadable durable record");
                    rehydrated.malformed += 1;
                    self.remove_logged(&key);
                }
            }
        }

        rehydrated.entries.sort_by_key(|(_, entry)| entry.stored_at);
        Ok(rehydrated)
    }

    /// Remove durable records past the stale window without decoding values.
    pub fn sweep_expired(&self, policy: &FreshnessPolicy, now: u64) -> Result<Vec<String>, PersistenceError> {
        let mut removed = Vec::new();
        for key in self.keys()? {
            let Some(record) = self.store.get(&key)? else {
                continue;
            };
            let dead = match serde_json::from_str::<RecordHeader>(&record) {
                Ok(header) => {
                    policy.classify_age(now.saturating_sub(header.stored_at)) == Freshness::Expired
                }
                Err(_) => true,
            };
            if dead {
                self.store.remove(&key)?;
                removed.push(key);
            }
        }
        Ok(removed)
    }

    /// Remove every record whose key (without the namespace prefix) matches.
    pub fn remove_where<F>(&self, mut predicate: F) -> Result<Vec<String>, PersistenceError>
    where
        F: FnMut(&str) -> bool,
    {
        let mut removed = Vec::new();
        for key in self.keys()? {
            if predicate(&key[self.prefix.len()..]) {
                self.store.remove(&key)?;
                removed.push(key);
            }
        }
        Ok(removed)
    }

    /// Remove every record of this namespace.
    pub fn purge(&self) -> Result<usize, PersistenceError> {
        Ok(self.remove_where(|_| true)?.len())
    }

    fn remove_logged(&self, key: &str) {
        if let Err(e) = self.store.remove(key) {
            warn!(key, error = %e, "Failed to remove durable record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::storage::MemoryStore;

    fn bridge(store: &Arc<MemoryStore>, ns: &str) -> PersistenceBridge {
        PersistenceBridge::new(store.clone() as Arc<dyn DurableStore>, ns)
    }

    #[test]
    fn test_write_and_read() {
        let store = Arc::new(MemoryStore::new());
        let b = bridge(&store, "ai");
        let entry = CacheEntry::new(vec![1u8, 2, 3], 4.0, 10);
        b.write("ai:k", &entry).unwrap();

        let record = store.get("ai:k").unwrap().unwrap();
        let back: CacheEntry<Vec<u8>> = serde_json::from_str(&record).unwrap();
        assert_eq!(back, entry);
        assert!(store.get("ai:missing").unwrap().is_none());
    }

    #[test]
    fn test_load_filters_namespace_and_age() {
        let store = Arc::new(MemoryStore::new());
        let ai = bridge(&store, "ai");
        let img = bridge(&store, "img");
        let policy = FreshnessPolicy::new(100, 1_000);

        ai.write("ai:old", &CacheEntry::new(1u32, 1.0, 0)).unwrap();
        ai.write("ai:new", &CacheEntry::new(2u32, 1.0, 1_500)).unwrap();
        ai.write("ai:mid", &CacheEntry::new(3u32, 1.0, 1_200)).unwrap();
        img.write("img:x", &CacheEntry::new(9u32, 1.0, 0)).unwrap();
        store.set("ai:junk", "not json").unwrap();

        let loaded = ai.load::<u32>(&policy, 2_000).unwrap();
        let keys: Vec<&str> = loaded.entries.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["ai:mid", "ai:new"]);
        assert_eq!(loaded.expired, 1);
        assert_eq!(loaded.malformed, 1);

        // Dead records are purged; the other namespace is untouched.
        assert!(store.get("ai:old").unwrap().is_none());
        assert!(store.get("ai:junk").unwrap().is_none());
        assert!(store.get("img:x").unwrap().is_some());
    }

    #[test]
    fn test_sweep_expired() {
        let store = Arc::new(MemoryStore::new());
        let b = bridge(&store, "ai");
        let policy = FreshnessPolicy::new(100, 1_000);
        b.write("ai:old", &CacheEntry::new("x", 1.0, 0)).unwrap();
        b.write("ai:new", &CacheEntry::new("y", 1.0, 900)).unwrap();

        let removed = b.sweep_expired(&policy, 1_500).unwrap();
        assert_eq!(removed, vec!["ai:old".to_string()]);
        assert_eq!(b.keys().unwrap(), vec!["ai:new".to_string()]);
    }

    #[test]
    fn test_remove_where_and_purge() {
        let store = Arc::new(MemoryStore::new());
        let b = bridge(&store, "ai");
        let other = bridge(&store, "other");
        for k in ["ai:user-1:a", "ai:user-1:b", "ai:user-2:a"] {
            b.write(k, &CacheEntry::new(0u8, 1.0, 0)).unwrap();
        }
        other.write("other:user-1:a", &CacheEntry::new(0u8, 1.0, 0)).unwrap();

        let removed = b.remove_where(|k| k.starts_with("user-1:")).unwrap();
        assert_eq!(removed.len(), 2);
        assert_eq!(b.purge().unwrap(), 1);
        assert!(b.keys().unwrap().is_empty());
        assert_eq!(other.keys().unwrap().len(), 1);
    }
}
