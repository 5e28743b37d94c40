//! Batched preloading with bounded concurrency.
//!
//! Requests are processed in chunks of `concurrency`. Every item of a chunk
//! runs through [`CacheManager::get_or_set`] concurrently, and the chunk is
//! fully settled before the next one starts. Results keep input order and one
//! failure never stops its siblings.

use std::future::Future;

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tracing::{debug, info};

use crate::cache::manager::{CacheError, CacheManager, Cacheable, FetchOptions};

/// Type-erased fetcher so heterogeneous closures fit in one batch.
pub type BoxFetcher<T> = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<T>> + Send>;

/// One item to preload.
pub struct PreloadRequest<T> {
    pub input: Value,
    pub fetcher: BoxFetcher<T>,
    pub options: FetchOptions,
}

impl<T: Send + 'static> PreloadRequest<T> {
    pub fn new<F, Fut>(input: Value, fetcher: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        Self {
            input,
            fetcher: Box::new(move || fetcher().boxed()),
            options: FetchOptions::default(),
        }
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of one preload item.
#[derive(Debug, Clone)]
pub struct PreloadResult<T> {
    /// Position of the item in the input.
    pub index: usize,
    pub outcome: Result<T, CacheError>,
}

impl<T> PreloadResult<T> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }
}

/// Drive `requests` through `manager`, at most `concurrency` at a time.
pub async fn batch_preload<T: Cacheable>(
    manager: &CacheManager<T>,
    requests: Vec<PreloadRequest<T>>,
    concurrency: usize,
) -> Vec<PreloadResult<T>> {
    let concurrency = concurrency.max(1);
    let total = requests.len();
    let mut results = Vec::with_capacity(total);
    let mut pending = requests.into_iter().enumerate().peekable();

    let mut chunk_no = 0usize;
    while pending.peek().is_some() {
        let chunk: Vec<_> = pending.by_ref().take(concurrency).collect();
        debug!(chunk = chunk_no, size = chunk.len(), "Preloading chunk");

        let settled = join_all(chunk.into_iter().map(|(index, request)| async move {
            let PreloadRequest {
                input,
                fetcher,
                options,
            } = request;
            let outcome = manager.get_or_set(&input, fetcher, options).await;
            PreloadResult { index, outcome }
        }))
        .await;

        results.extend(settled);
        chunk_no += 1;
    }

    let failed = results.iter().filter(|r| !r.is_ok()).count();
    info!(
        namespace = %manager.namespace(),
        total,
        failed,
        chunks = chunk_no,
        "Batch preload complete"
    );
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::persist::storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn manager() -> CacheManager<u32> {
        let config = CacheConfig::new("batch", 50, Duration::from_secs(60), Duration::from_secs(120));
        CacheManager::new(config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let results = batch_preload(&manager(), Vec::new(), 3).await;
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_zero_concurrency_is_sequential() {
        let cache = manager();
        let requests = (0..4u32)
            .map(|i| PreloadRequest::new(json!({ "i": i }), move || async move { Ok(i * 10) }))
            .collect();

        let results = batch_preload(&cache, requests, 0).await;
        let values: Vec<u32> = results.into_iter().map(|r| r.outcome.unwrap()).collect();
        assert_eq!(values, vec![0, 10, 20, 30]);
        assert_eq!(cache.len(), 4);
    }

    #[tokio::test]
    async fn test_already_cached_items_skip_fetch() {
        let cache = manager();
        cache
            .get_or_set(&json!({"i": 1}), || async { Ok(111) }, FetchOptions::default())
            .await
            .unwrap();

        let requests = vec![
            PreloadRequest::new(json!({"i": 1}), || async { Ok(999) }),
            PreloadRequest::new(json!({"i": 2}), || async { Ok(222) }),
        ];
        let results = cache.batch_preload(requests, 2).await;
        assert_eq!(results[0].outcome.as_ref().unwrap(), &111);
        assert_eq!(results[1].outcome.as_ref().unwrap(), &222);
    }
}
