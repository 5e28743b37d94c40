//! Freshness policy: decides whether a cached entry may be served.
//!
//! ```text
//!  age:  0 ──── ttl ──────────── stale_window ────────▶
//!        [ Fresh )[     Stale      )[   Expired ...
//! ```

use crate::cache::entry::CacheEntry;
use crate::config::CacheConfig;

/// Classification of a cached entry at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Serve as-is.
    Fresh,
    /// Servable only while a refresh is running.
    Stale,
    /// Must be refetched.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreshnessPolicy {
    ttl_ms: u64,
    stale_window_ms: u64,
}

impl FreshnessPolicy {
    /// `stale_window_ms` is raised to `ttl_ms` if shorter.
    pub fn new(ttl_ms: u64, stale_window_ms: u64) -> Self {
        Self {
            ttl_ms,
            stale_window_ms: stale_window_ms.max(ttl_ms),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.ttl_ms, config.stale_while_revalidate_ms)
    }

    pub fn classify_age(&self, age_ms: u64) -> Freshness {
        if age_ms < self.ttl_ms {
            Freshness::Fresh
        } else if age_ms < self.stale_window_ms {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }

    pub fn classify<T>(&self, entry: &CacheEntry<T>, now: u64) -> Freshness {
        self.classify_age(entry.age_millis(now))
    }

    /// Whether an entry is past the stale window and should be dropped.
    pub fn is_expired<T>(&self, entry: &CacheEntry<T>, now: u64) -> bool {
        self.classify(entry, now) == Freshness::Expired
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttl_ms
    }

    pub fn stale_window_ms(&self) -> u64 {
        self.stale_window_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boundaries() {
        let policy = FreshnessPolicy::new(100, 1000);
        assert_eq!(policy.classify_age(0), Freshness::Fresh);
        assert_eq!(policy.classify_age(99), Freshness::Fresh);
        assert_eq!(policy.classify_age(100), Freshness::Stale);
        assert_eq!(policy.classify_age(999), Freshness::Stale);
        assert_eq!(policy.classify_age(1000), Freshness::Expired);
    }

    #[test]
    fn test_no_stale_window() {
        let policy = FreshnessPolicy::new(100, 100);
        assert_eq!(policy.classify_age(99), Freshness::Fresh);
        assert_eq!(policy.classify_age(100), Freshness::Expired);
    }

    #[test]
    fn test_classify_entry() {
        let policy = FreshnessPolicy::new(100, 1000);
        let entry = CacheEntry::new(1u32, 1.0, 5_000);
        assert_eq!(policy.classify(&entry, 5_050), Freshness::Fresh);
        assert_eq!(policy.classify(&entry, 5_150), Freshness::Stale);
        assert!(policy.is_expired(&entry, 6_000));
        // Clock skew backwards reads as age zero.
        assert_eq!(policy.classify(&entry, 4_000), Freshness::Fresh);
    }
}
