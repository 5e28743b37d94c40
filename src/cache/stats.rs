//! Cache statistics.
//!
//! [`CacheStats`] is a point-in-time view computed from the live entries;
//! [`CacheCounters`] accumulates lifetime events with relaxed atomics.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::cache::entry::CacheEntry;

/// Snapshot of a manager's contents.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub total_items: usize,
    /// Sum of per-entry hit counts.
    pub total_hits: u64,
    pub total_cost: f64,
    pub avg_age_seconds: f64,
    /// `total_hits / (total_hits + total_items)`: reads served per read-or-write.
    pub hit_rate: f64,
    /// Approximate bytes held (serialized values plus keys).
    pub memory_usage: usize,
}

impl CacheStats {
    /// Compute a snapshot over `(key, entry)` pairs at time `now`.
    pub fn collect<'a, T: 'a>(
        entries: impl Iterator<Item = (&'a str, &'a CacheEntry<T>)>,
        now: u64,
    ) -> Self {
        let mut stats = CacheStats::default();
        let mut total_age_ms: u128 = 0;

        for (key, entry) in entries {
            stats.total_items += 1;
            stats.total_hits += entry.hit_count;
            stats.total_cost += entry.cost;
            stats.memory_usage += key.len() + entry.size_bytes;
            total_age_ms += u128::from(entry.age_millis(now));
        }

        if stats.total_items > 0 {
            stats.avg_age_seconds = total_age_ms as f64 / stats.total_items as f64 / 1000.0;
        }
        let denominator = stats.total_hits + stats.total_items as u64;
        if denominator > 0 {
            stats.hit_rate = stats.total_hits as f64 / denominator as f64;
        }
        stats
    }
}

/// Lifetime event counters.
#[derive(Debug, Default)]
pub struct CacheCounters {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    fetches: AtomicU64,
    fetch_errors: AtomicU64,
    evictions: AtomicU64,
    persist_failures: AtomicU64,
}

/// Plain copy of [`CacheCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub fetches: u64,
    pub fetch_errors: u64,
    pub evictions: u64,
    pub persist_failures: u64,
}

impl CacheCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_stale_hit(&self) {
        self.stale_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch(&self) {
        self.fetches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persist_failure(&self) {
        self.persist_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fetches: self.fetches.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            persist_failures: self.persist_failures.load(Ordering::Relaxed),
        }
    }

    /// Fraction of lookups answered from cache (fresh or stale).
    pub fn lookup_hit_ratio(&self) -> f64 {
        let s = self.snapshot();
        let served = s.hits + s.stale_hits;
        let total = served + s.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
