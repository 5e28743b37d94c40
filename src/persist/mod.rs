//! Durable storage for cache entries.
//!
//! - [`storage`]: The [`DurableStore`](storage::DurableStore) capability and its
//!   in-memory and file-backed implementations
//! - [`bridge`]: Namespaced entry records on top of a store

pub mod bridge;
pub mod storage;
