//! In-flight request coalescing.
//!
//! At most one computation per key runs at a time. The first caller creates
//! the computation and registers it; every later caller for the same key gets a
//! clone of the same [`Shared`] future and therefore observes the identical
//! result or error. The computation deregisters itself once it settles.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tracing::debug;

use crate::cache::manager::CacheError;

/// A computation that may be awaited by many callers.
pub type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, CacheError>>>;

struct Pending<T> {
    generation: u64,
    future: SharedFetch<T>,
}

struct PendingMap<T> {
    next_generation: u64,
    entries: HashMap<String, Pending<T>>,
}

pub struct RequestCoalescer<T> {
    pending: Arc<Mutex<PendingMap<T>>>,
}

impl<T> Default for RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> RequestCoalescer<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(PendingMap {
                next_generation: 0,
                entries: HashMap::new(),
            })),
        }
    }

    /// Join the pending computation for `key`, or start one with `factory`.
    ///
    /// Registration happens before this returns, so two calls made back to
    /// back can never both start a computation. `factory` runs under the
    /// registry lock and must only build the future, not poll it.
    pub fn dedupe<F, Fut>(&self, key: &str, factory: F) -> SharedFetch<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CacheError>> + Send + 'static,
    {
        let mut map = self.pending.lock();
        if let Some(pending) = map.entries.get(key) {
            debug!(key, "Joining in-flight request");
            return pending.future.clone();
        }

        let generation = map.next_generation;
        map.next_generation += 1;

        let registry: Weak<Mutex<PendingMap<T>>> = Arc::downgrade(&self.pending);
        let owned_key = key.to_string();
        let computation = factory();
        let future = async move {
            let result = computation.await;
            if let Some(registry) = registry.upgrade() {
                let mut map = registry.lock();
                let ours = map
                    .entries
                    .get(&owned_key)
                    .is_some_and(|p| p.generation == generation);
                if ours {
                    map.entries.remove(&owned_key);
                }
            }
            result
        }
        .boxed()
        .shared();

        map.entries.insert(
            key.to_string(),
            Pending {
                generation,
                future: future.clone(),
            },
        );
        future
    }

    pub fn is_pending(&self, key: &str) -> bool {
        self.pending.lock().entries.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().entries.len()
    }

    /// Forget every registration. Computations already awaited keep running
    /// for their current callers; new callers start fresh.
    pub fn cancel_all(&self) -> usize {
        let mut map = self.pending.lock();
        let cancelled = map.entries.len();
        map.entries.clear();
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let coalescer: RequestCoalescer<u32> = RequestCoalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<u32>();

        let c1 = calls.clone();
        let first = coalescer.dedupe("k", move || async move {
            c1.fetch_add(1, Ordering::SeqCst);
            Ok(rx.await.unwrap_or(0))
        });
        let c2 = calls.clone();
        let second = coalescer.dedupe("k", move || async move {
            c2.fetch_add(1, Ordering::SeqCst);
            Ok(99)
        });
        assert!(coalescer.is_pending("k"));

        tx.send(7).unwrap();
        let (a, b) = tokio::join!(first, second);
        assert_eq!(a.unwrap(), 7);
        assert_eq!(b.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!coalescer.is_pending("k"));
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_deregistered() {
        let coalescer: RequestCoalescer<u32> = RequestCoalescer::new();
        let first = coalescer.dedupe("k", || async {
            Err(CacheError::Fetch(Arc::new(anyhow::anyhow!("quota exhausted"))))
        });
        let second = coalescer.dedupe("k", || async { Ok(1) });

        let (a, b) = tokio::join!(first, second);
        match (a, b) {
            (Err(CacheError::Fetch(ea)), Err(CacheError::Fetch(eb))) => {
                assert!(Arc::ptr_eq(&ea, &eb));
            }
            other => panic!("expected shared fetch error, got {other:?}"),
        }
        assert_eq!(coalescer.pending_count(), 0);

        // A later call starts a new computation.
        let third = coalescer.dedupe("k", || async { Ok(5) }).await;
        assert_eq!(third.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_distinct_keys_are_independent() {
        let coalescer: RequestCoalescer<&'static str> = RequestCoalescer::new();
        let a = coalescer.dedupe("a", || async { Ok("a") });
        let b = coalescer.dedupe("b", || async { Ok("b") });
        assert_eq!(coalescer.pending_count(), 2);
        assert_eq!(a.await.unwrap(), "a");
        assert_eq!(b.await.unwrap(), "b");
    }

    #[tokio::test]
    async fn test_cancel_all_does_not_let_old_computation_evict_new_one() {
        let coalescer: RequestCoalescer<u32> = RequestCoalescer::new();
        let (tx, rx) = oneshot::channel::<u32>();
        let old = coalescer.dedupe("k", move || async move { Ok(rx.await.unwrap_or(0)) });

        assert_eq!(coalescer.cancel_all(), 1);
        let (tx2, rx2) = oneshot::channel::<u32>();
        let new = coalescer.dedupe("k", move || async move { Ok(rx2.await.unwrap_or(0)) });

        tx.send(1).unwrap();
        assert_eq!(old.await.unwrap(), 1);
        // The newer registration survives the older one settling.
        assert!(coalescer.is_pending("k"));

        tx2.send(2).unwrap();
        assert_eq!(new.await.unwrap(), 2);
        assert!(!coalescer.is_pending("k"));
    }
}
