//! Memoizing wrapper around async functions.
//!
//! [`CachedFn`] routes every call of a wrapped function through a
//! [`CacheManager`]. The cache input is either produced by a caller-supplied
//! key generator or, by default, the function name plus its serialized
//! arguments.

use std::future::Future;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};

use crate::cache::manager::{CacheError, CacheManager, Cacheable, FetchOptions};

type KeyFn<A> = Arc<dyn Fn(&A) -> Value + Send + Sync>;

pub struct CachedFn<A, T, F> {
    manager: CacheManager<T>,
    name: String,
    func: Arc<F>,
    key_fn: Option<KeyFn<A>>,
    options: FetchOptions,
}

impl<A, T, F, Fut> CachedFn<A, T, F>
where
    A: Serialize + Send + 'static,
    T: Cacheable,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    /// Wrap `func`. `name` keeps functions sharing a manager apart.
    pub fn new(manager: CacheManager<T>, name: impl Into<String>, func: F) -> Self {
        Self {
            manager,
            name: name.into(),
            func: Arc::new(func),
            key_fn: None,
            options: FetchOptions::default(),
        }
    }

    /// Derive the cache input from the arguments with `key_fn` instead.
    pub fn with_key<K>(mut self, key_fn: K) -> Self
    where
        K: Fn(&A) -> Value + Send + Sync + 'static,
    {
        self.key_fn = Some(Arc::new(key_fn));
        self
    }

    pub fn with_options(mut self, options: FetchOptions) -> Self {
        self.options = options;
        self
    }

    pub fn manager(&self) -> &CacheManager<T> {
        &self.manager
    }

    /// Cache input used for `args`.
    pub fn input_for(&self, args: &A) -> Result<Value, CacheError> {
        match &self.key_fn {
            Some(key_fn) => Ok(key_fn(args)),
            None => {
                let args = serde_json::to_value(args).map_err(|e| CacheError::Key(e.to_string()))?;
                Ok(json!({ "fn": self.name, "args": args }))
            }
        }
    }

    /// Call the wrapped function through the cache.
    pub async fn call(&self, args: A) -> Result<T, CacheError> {
        let input = self.input_for(&args)?;
        let func = Arc::clone(&self.func);
        self.manager
            .get_or_set(&input, move || func(args), self.options)
            .await
    }
}

/// Shorthand for [`CachedFn::new`].
pub fn memoize<A, T, F, Fut>(manager: CacheManager<T>, name: impl Into<String>, func: F) -> CachedFn<A, T, F>
where
    A: Serialize + Send + 'static,
    T: Cacheable,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    CachedFn::new(manager, name, func)
}
