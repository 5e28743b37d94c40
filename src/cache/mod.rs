//! Coalescing, stale-while-revalidate cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`key`]: Deterministic keys derived from structured inputs
//! - [`entry`]: Stored entries and the clock they are timestamped with
//! - [`store`]: Capacity-bounded LRU store
//! - [`freshness`]: Fresh / stale / expired classification
//! - [`coalescer`]: One shared fetch per key
//! - [`manager`]: The namespaced facade tying it all together
//! - [`batch`]: Bounded-concurrency preloading
//! - [`memoize`]: Caching wrapper for async functions
//! - [`stats`]: Snapshots and lifetime counters

pub mod batch;
pub mod coalescer;
pub mod entry;
pub mod freshness;
pub mod key;
pub mod manager;
pub mod memoize;
pub mod stats;
pub mod store;
