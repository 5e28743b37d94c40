//! genai-cache: coalescing stale-while-revalidate cache for expensive
//! generative-AI calls.
//!
//! A [`CacheManager`] derives a stable key from each structured request,
//! shares one in-flight fetch between concurrent callers, keeps results in a
//! bounded LRU store, serves stale results while refreshing them in the
//! background, and mirrors everything into a [`DurableStore`] so a restarted
//! process comes back warm.

pub mod cache;
pub mod config;
pub mod persist;

pub use cache::batch::{batch_preload, PreloadRequest, PreloadResult};
pub use cache::entry::{CacheEntry, Clock, ManualClock, SystemClock};
pub use cache::key::{derive_key, derive_key_from};
pub use cache::manager::{
    CacheError, CacheEvent, CacheManager, Cacheable, FetchOptions, Lookup, RefreshHandle, Source,
};
pub use cache::memoize::{memoize, CachedFn};
pub use cache::stats::{CacheStats, CounterSnapshot};
pub use config::{CacheConfig, Config, ConfigError};
pub use persist::storage::{DurableStore, FileStore, MemoryStore, PersistenceError};
