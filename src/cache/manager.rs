//! Cache manager: the public facade over the cache components.
//!
//! A manager owns one namespace. It:
//! - Derives keys from structured request inputs
//! - Serves fresh entries from the LRU store
//! - Serves stale entries while a supervised background refresh runs
//! - Routes misses through the request coalescer
//! - Mirrors writes and removals into durable storage (best effort)
//! - Sweeps entries past the stale window on a timer
//!
//! Managers are cheap to clone; clones share state.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::batch::{self, PreloadRequest, PreloadResult};
use crate::cache::coalescer::{RequestCoalescer, SharedFetch};
use crate::cache::entry::{CacheEntry, Clock, SystemClock};
use crate::cache::freshness::{Freshness, FreshnessPolicy};
use crate::cache::key::derive_key_from;
use crate::cache::stats::{CacheCounters, CacheStats, CounterSnapshot};
use crate::cache::store::EvictionStore;
use crate::config::{CacheConfig, Config, ConfigError};
use crate::persist::bridge::PersistenceBridge;
use crate::persist::storage::DurableStore;

/// Errors visible to callers of the cache.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// The fetcher failed. Every caller joined on the same fetch receives the
    /// same shared error.
    #[error("fetch failed: {0:#}")]
    Fetch(Arc<anyhow::Error>),

    #[error("input cannot be used as a cache key: {0}")]
    Key(String),

    #[error("background refresh did not complete: {0}")]
    RefreshAborted(String),
}

impl CacheError {
    /// The fetcher's own error, if this is a fetch failure.
    pub fn fetch_error(&self) -> Option<&anyhow::Error> {
        match self {
            CacheError::Fetch(e) => Some(e),
            _ => None,
        }
    }
}

/// Values a manager can hold.
pub trait Cacheable: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> Cacheable for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Per-call knobs for [`CacheManager::get_or_set`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchOptions {
    /// Relative expense recorded on the stored entry.
    pub cost: f64,
    /// Skip the cache and always fetch.
    pub force_refresh: bool,
    /// Serve stale entries immediately and refresh them in the background.
    pub background_refresh: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cost: 1.0,
            force_refresh: false,
            background_refresh: false,
        }
    }
}

impl FetchOptions {
    pub fn with_cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn background_refresh(mut self) -> Self {
        self.background_refresh = true;
        self
    }
}

/// Where a looked-up value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Fresh,
    Stale,
    Fetched,
}

/// Result of [`CacheManager::lookup`].
#[derive(Debug)]
pub struct Lookup<T> {
    pub value: T,
    pub source: Source,
    /// Present when a stale value was served and a refresh was spawned.
    pub refresh: Option<RefreshHandle<T>>,
}

/// Handle to a background refresh.
#[derive(Debug)]
pub struct RefreshHandle<T> {
    key: String,
    handle: JoinHandle<Result<T, CacheError>>,
}

impl<T> RefreshHandle<T> {
    /// Full cache key being refreshed.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the refresh to settle.
    pub async fn outcome(self) -> Result<T, CacheError> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(CacheError::RefreshAborted(e.to_string())),
        }
    }
}

/// Notifications published by a manager.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    RefreshCompleted { key: String },
    RefreshFailed { key: String, error: String },
    Evicted { key: String },
    Swept { removed: usize },
    Cleared { cancelled_fetches: usize },
}

const EVENT_CAPACITY: usize = 64;

struct Inner<T> {
    config: CacheConfig,
    policy: FreshnessPolicy,
    store: Mutex<EvictionStore<T>>,
    coalescer: RequestCoalescer<T>,
    bridge: PersistenceBridge,
    clock: Arc<dyn Clock>,
    counters: CacheCounters,
    /// Bumped by `clear`; fetches started under an older epoch are not stored.
    epoch: AtomicU64,
    events: broadcast::Sender<CacheEvent>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Cacheable> Inner<T> {
    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.bridge.prefix(), key)
    }

    /// Write `value` to memory and durable storage.
    ///
    /// With `epoch` set, the write is dropped if a `clear` has happened since
    /// that epoch. The check and both writes happen under the store lock, so a
    /// concurrent `clear` either sees the entry or prevents it.
    fn store_entry(&self, key: String, value: T, cost: f64, epoch: Option<u64>) -> bool {
        let entry = CacheEntry::new(value, cost, self.clock.now_millis());

        let evicted = {
            let mut store = self.store.lock();
            if epoch.is_some_and(|e| e != self.epoch.load(Ordering::SeqCst)) {
                return false;
            }
            if let Err(e) = self.bridge.write(&key, &entry) {
                self.counters.record_persist_failure();
                warn!(key = %key, error = %e, "Durable write skipped");
            }
            store.insert(key, entry)
        };

        if let Some(evicted) = evicted {
            self.counters.record_eviction();
            self.remove_durable(&evicted);
            debug!(key = %evicted, "Evicted entry");
            let _ = self.events.send(CacheEvent::Evicted { key: evicted });
        }
        true
    }

    fn remove_durable(&self, key: &str) {
        if let Err(e) = self.bridge.remove(key) {
            self.counters.record_persist_failure();
            warn!(key, error = %e, "Durable remove skipped");
        }
    }

    fn rehydrate(&self) -> usize {
        let now = self.clock.now_millis();
        let loaded = match self.bridge.load::<T>(&self.policy, now) {
            Ok(loaded) => loaded,
            Err(e) => {
                self.counters.record_persist_failure();
                warn!(namespace = %self.config.namespace, error = %e, "Rehydration skipped");
                return 0;
            }
        };

        let mut restored = 0usize;
        let mut live = 0usize;
        let mut evicted = Vec::new();
        {
            let mut store = self.store.lock();
            for (key, entry) in loaded.entries {
                // The in-memory copy is at least as new and carries the hit count.
                if store.contains(&key) {
                    live += 1;
                    continue;
                }
                restored += 1;
                evicted.extend(store.insert(key, entry));
            }
        }
        for key in &evicted {
            self.remove_durable(key);
        }

        info!(
            namespace = %self.config.namespace,
            restored = restored - evicted.len(),
            expired = loaded.expired,
            malformed = loaded.malformed,
            already_live = live,
            over_capacity = evicted.len(),
            "Rehydrated from durable storage"
        );
        restored - evicted.len()
    }

    fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let removed = self
            .store
            .lock()
            .retain(|_, entry| !self.policy.is_expired(entry, now));
        for key in &removed {
            self.remove_durable(key);
        }

        let durable_only = match self.bridge.sweep_expired(&self.policy, now) {
            Ok(keys) => keys.len(),
            Err(e) => {
                self.counters.record_persist_failure();
                warn!(namespace = %self.config.namespace, error = %e, "Durable sweep skipped");
                0
            }
        };

        let total = removed.len() + durable_only;
        if total > 0 {
            info!(
                namespace = %self.config.namespace,
                memory = removed.len(),
                durable = durable_only,
                "Sweep removed expired entries"
            );
        }
        let _ = self.events.send(CacheEvent::Swept { removed: total });
        total
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.sweeper.get_mut().take() {
            handle.abort();
        }
    }
}

/// A namespaced, coalescing, stale-while-revalidate cache.
pub struct CacheManager<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CacheManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Cacheable> CacheManager<T> {
    /// Create a manager on the wall clock and rehydrate it from `store`.
    pub fn new(config: CacheConfig, store: Arc<dyn DurableStore>) -> Result<Self, ConfigError> {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// Create a manager with an explicit clock and rehydrate it from `store`.
    pub fn with_clock(
        config: CacheConfig,
        store: Arc<dyn DurableStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            policy: FreshnessPolicy::from_config(&config),
            store: Mutex::new(EvictionStore::new(config.max_size)),
            coalescer: RequestCoalescer::new(),
            bridge: PersistenceBridge::new(store, &config.namespace),
            clock,
            counters: CacheCounters::new(),
            epoch: AtomicU64::new(0),
            events,
            sweeper: Mutex::new(None),
            config,
        };
        inner.rehydrate();

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Create the manager for profile `name` of `config`.
    ///
    /// Starts the periodic sweeper when `config.sweep.enabled` is set, which
    /// requires a tokio runtime.
    pub fn open(config: &Config, name: &str, store: Arc<dyn DurableStore>) -> Result<Self, ConfigError> {
        let manager = Self::new(config.profile(name)?.clone(), store)?;
        if config.sweep.enabled {
            manager.start_sweeper(config.sweep.interval());
        }
        Ok(manager)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn namespace(&self) -> &str {
        &self.inner.config.namespace
    }

    pub fn len(&self) -> usize {
        self.inner.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.lock().is_empty()
    }

    /// Number of fetches currently in flight.
    pub fn pending_fetches(&self) -> usize {
        self.inner.coalescer.pending_count()
    }

    /// Re-read durable storage into memory. Returns entries restored.
    pub fn load_from_durable_storage(&self) -> usize {
        self.inner.rehydrate()
    }

    /// Read a value by literal key, counting the hit.
    ///
    /// Entries past the stale window are dropped instead of returned.
    pub fn get(&self, key: &str) -> Option<T> {
        let full = self.inner.full_key(key);
        let now = self.inner.clock.now_millis();

        let found = {
            let mut store = self.inner.store.lock();
            let expired = store.peek(&full).map(|e| self.inner.policy.is_expired(e, now));
            match expired {
                Some(true) => {
                    store.remove(&full);
                    Err(())
                }
                Some(false) => Ok(store.get(&full).map(|e| e.value.clone())),
                None => Ok(None),
            }
        };

        match found {
            Ok(Some(value)) => {
                self.inner.counters.record_hit();
                Some(value)
            }
            Ok(None) => {
                self.inner.counters.record_miss();
                None
            }
            Err(()) => {
                self.inner.counters.record_miss();
                self.inner.remove_durable(&full);
                debug!(key = %full, "Dropped expired entry on read");
                None
            }
        }
    }

    /// Copy of the entry under `key` without counting a hit.
    pub fn peek_entry(&self, key: &str) -> Option<CacheEntry<T>> {
        let full = self.inner.full_key(key);
        self.inner.store.lock().peek(&full).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        let full = self.inner.full_key(key);
        self.inner.store.lock().contains(&full)
    }

    /// Unconditionally store `value` under `key`.
    pub fn set(&self, key: &str, value: T, cost: f64) {
        let full = self.inner.full_key(key);
        self.inner.store_entry(full, value, cost, None);
    }

    /// Remove `key` from memory and durable storage.
    pub fn delete(&self, key: &str) -> bool {
        let full = self.inner.full_key(key);
        let removed = self.inner.store.lock().remove(&full).is_some();
        self.inner.remove_durable(&full);
        removed
    }

    /// Remove every entry whose literal key matches `predicate`.
    pub fn delete_where<F>(&self, predicate: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        let prefix_len = self.inner.bridge.prefix().len();
        let mut removed: HashSet<String> = self
            .inner
            .store
            .lock()
            .retain(|key, _| !predicate(&key[prefix_len..]))
            .into_iter()
            .collect();

        match self.inner.bridge.remove_where(&predicate) {
            Ok(keys) => removed.extend(keys),
            Err(e) => {
                self.inner.counters.record_persist_failure();
                warn!(namespace = %self.namespace(), error = %e, "Durable delete skipped");
            }
        }
        removed.len()
    }

    /// The cache key `input` maps to in this manager.
    pub fn key_for<I: Serialize + ?Sized>(&self, input: &I) -> Result<String, CacheError> {
        derive_key_from(input)
    }

    /// Return the cached value for `input`, fetching it if needed.
    pub async fn get_or_set<I, F, Fut>(
        &self,
        input: &I,
        fetcher: F,
        options: FetchOptions,
    ) -> Result<T, CacheError>
    where
        I: Serialize + ?Sized,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Ok(self.lookup(input, fetcher, options).await?.value)
    }

    /// Like [`get_or_set`](Self::get_or_set) but reports where the value came
    /// from and hands back the background refresh, if one was spawned.
    pub async fn lookup<I, F, Fut>(
        &self,
        input: &I,
        fetcher: F,
        options: FetchOptions,
    ) -> Result<Lookup<T>, CacheError>
    where
        I: Serialize + ?Sized,
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let key = derive_key_from(input)?;
        let full = self.inner.full_key(&key);

        if !options.force_refresh {
            let now = self.inner.clock.now_millis();
            let cached = {
                let mut store = self.inner.store.lock();
                let freshness = store.peek(&full).map(|e| self.inner.policy.classify(e, now));
                match freshness {
                    Some(Freshness::Fresh) => store.get(&full).map(|e| (Source::Fresh, e.value.clone())),
                    Some(Freshness::Stale) if options.background_refresh => {
                        store.get(&full).map(|e| (Source::Stale, e.value.clone()))
                    }
                    _ => None,
                }
            };

            match cached {
                Some((Source::Fresh, value)) => {
                    self.inner.counters.record_hit();
                    debug!(key = %full, "Fresh hit");
                    return Ok(Lookup {
                        value,
                        source: Source::Fresh,
                        refresh: None,
                    });
                }
                Some((source, value)) => {
                    self.inner.counters.record_stale_hit();
                    debug!(key = %full, "Stale hit, refreshing in background");
                    let refresh = self.spawn_refresh(full, fetcher, options.cost);
                    return Ok(Lookup {
                        value,
                        source,
                        refresh: Some(refresh),
                    });
                }
                None => {}
            }
        }

        self.inner.counters.record_miss();
        let value = self.fetch_coalesced(&full, fetcher, options.cost).await?;
        Ok(Lookup {
            value,
            source: Source::Fetched,
            refresh: None,
        })
    }

    fn fetch_coalesced<F, Fut>(&self, full: &str, fetcher: F, cost: f64) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        let epoch = self.inner.epoch.load(Ordering::SeqCst);
        let key = full.to_string();

        self.inner.coalescer.dedupe(full, move || async move {
            if let Some(inner) = weak.upgrade() {
                inner.counters.record_fetch();
            }
            debug!(key = %key, "Fetching");

            match fetcher().await {
                Ok(value) => {
                    let stored = weak.upgrade().is_some_and(|inner| {
                        inner.store_entry(key.clone(), value.clone(), cost, Some(epoch))
                    });
                    if !stored {
                        debug!(key = %key, "Discarding fetch that outlived a clear");
                    }
                    Ok(value)
                }
                Err(e) => {
                    if let Some(inner) = weak.upgrade() {
                        inner.counters.record_fetch_error();
                    }
                    debug!(key = %key, error = %e, "Fetch failed");
                    Err(CacheError::Fetch(Arc::new(e)))
                }
            }
        })
    }

    fn spawn_refresh<F, Fut>(&self, full: String, fetcher: F, cost: f64) -> RefreshHandle<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        // Registered with the coalescer before the task is spawned.
        let fetch = self.fetch_coalesced(&full, fetcher, cost);
        let events = self.inner.events.clone();
        let key = full.clone();

        let handle = tokio::spawn(async move {
            let result = fetch.await;
            match &result {
                Ok(_) => {
                    debug!(key = %key, "Background refresh complete");
                    let _ = events.send(CacheEvent::RefreshCompleted { key });
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Background refresh failed");
                    let _ = events.send(CacheEvent::RefreshFailed {
                        key,
                        error: e.to_string(),
                    });
                }
            }
            result
        });

        RefreshHandle { key: full, handle }
    }

    /// Preload many inputs, at most `concurrency` at a time.
    pub async fn batch_preload(
        &self,
        requests: Vec<PreloadRequest<T>>,
        concurrency: usize,
    ) -> Vec<PreloadResult<T>> {
        batch::batch_preload(self, requests, concurrency).await
    }

    /// Snapshot of the current contents.
    pub fn stats(&self) -> CacheStats {
        let now = self.inner.clock.now_millis();
        let store = self.inner.store.lock();
        CacheStats::collect(store.iter(), now)
    }

    /// Lifetime event counters.
    pub fn counters(&self) -> CounterSnapshot {
        self.inner.counters.snapshot()
    }

    /// Fraction of lookups answered from memory, fresh or stale.
    pub fn lookup_hit_ratio(&self) -> f64 {
        self.inner.counters.lookup_hit_ratio()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.inner.events.subscribe()
    }

    /// Remove entries past the stale window from memory and durable storage.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Run [`sweep`](Self::sweep) every `interval` until destroyed or dropped.
    ///
    /// Must be called from within a tokio runtime. Replaces any running sweeper.
    pub fn start_sweeper(&self, interval: Duration) {
        let weak = Arc::downgrade(&self.inner);
        let interval = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match weak.upgrade() {
                    Some(inner) => {
                        inner.sweep();
                    }
                    None => break,
                }
            }
        });

        if let Some(previous) = self.inner.sweeper.lock().replace(handle) {
            previous.abort();
        }
        info!(namespace = %self.namespace(), interval_secs = interval.as_secs(), "Sweeper started");
    }

    pub fn sweeper_running(&self) -> bool {
        self.inner
            .sweeper
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    /// Empty memory, forget in-flight fetches and purge durable records.
    pub fn clear(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);
        let cancelled_fetches = self.inner.coalescer.cancel_all();
        self.inner.store.lock().clear();

        let purged = match self.inner.bridge.purge() {
            Ok(n) => n,
            Err(e) => {
                self.inner.counters.record_persist_failure();
                warn!(namespace = %self.namespace(), error = %e, "Durable purge skipped");
                0
            }
        };

        info!(namespace = %self.namespace(), cancelled_fetches, purged, "Cache cleared");
        let _ = self.inner.events.send(CacheEvent::Cleared { cancelled_fetches });
    }

    /// Stop the sweeper, then [`clear`](Self::clear).
    pub fn destroy(&self) {
        if let Some(handle) = self.inner.sweeper.lock().take() {
            handle.abort();
        }
        self.clear();
    }
}
