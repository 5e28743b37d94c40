//! Cache entry types and the clock that stamps them.
//!
//! An entry is the unit of storage in both the in-memory LRU and the durable
//! store. Timestamps are wall-clock epoch milliseconds so that entries survive
//! a process restart with their age intact.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cache::key::fnv1a_base36;

/// Source of "now" for freshness decisions.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> u64;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }
}

/// A clock that only moves when told to. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_millis)),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A single cached value with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    /// The cached value.
    pub value: T,

    /// When the value was written (epoch ms). Reset on every write.
    pub stored_at: u64,

    /// FNV-1a digest of the serialized value.
    pub content_hash: String,

    /// Reads served from this entry since it was written.
    pub hit_count: u64,

    /// Relative expense of producing the value.
    pub cost: f64,

    /// Serialized size of the value in bytes.
    #[serde(default)]
    pub size_bytes: usize,
}

impl<T: Serialize> CacheEntry<T> {
    /// Create a fresh entry stamped at `now`.
    pub fn new(value: T, cost: f64, now: u64) -> Self {
        // Values that cannot be serialized still cache in memory; they just
        // carry an empty digest and fail later at the durable write.
        let (content_hash, size_bytes) = match serde_json::to_vec(&value) {
            Ok(bytes) => (fnv1a_base36(&bytes), bytes.len()),
            Err(_) => (String::new(), 0),
        };
        Self {
            value,
            stored_at: now,
            content_hash,
            hit_count: 0,
            cost,
            size_bytes,
        }
    }
}

impl<T> CacheEntry<T> {
    /// Age of the entry in milliseconds at `now`.
    pub fn age_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.stored_at)
    }

    /// Record a read.
    pub fn touch(&mut self) {
        self.hit_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_shared_between_clones() {
        let clock = ManualClock::new(1_000);
        let other = clock.clone();
        other.advance(Duration::from_millis(250));
        assert_eq!(clock.now_millis(), 1_250);
        clock.set(5);
        assert_eq!(other.now_millis(), 5);
    }

    #[test]
    fn test_entry_new_and_touch() {
        let mut entry = CacheEntry::new("hello".to_string(), 2.5, 100);
        assert_eq!(entry.hit_count, 0);
        assert_eq!(entry.stored_at, 100);
        assert_eq!(entry.size_bytes, "\"hello\"".len());
        assert_eq!(entry.content_hash.len(), 13);

        entry.touch();
        entry.touch();
        assert_eq!(entry.hit_count, 2);
        assert_eq!(entry.age_millis(350), 250);
        assert_eq!(entry.age_millis(50), 0);
    }

    #[test]
    fn test_content_hash_tracks_value() {
        let a = CacheEntry::new(vec![1, 2, 3], 1.0, 0);
        let b = CacheEntry::new(vec![1, 2, 3], 1.0, 99);
        let c = CacheEntry::new(vec![3, 2, 1], 1.0, 0);
        assert_eq!(a.content_hash, b.content_hash);
        assert_ne!(a.content_hash, c.content_hash);
    }
}
