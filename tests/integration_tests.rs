//! End-to-end tests: durable persistence across restarts and batch preloading.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tempfile::TempDir;

use genai_cache::persist::storage::DurableStore;
use genai_cache::{
    CacheConfig, CacheManager, Clock, FetchOptions, FileStore, ManualClock, MemoryStore,
    PreloadRequest,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Analysis {
    style: String,
    confidence: f32,
}

fn analysis_config() -> CacheConfig {
    CacheConfig::new(
        "ai-analysis",
        100,
        Duration::from_secs(30 * 60),
        Duration::from_secs(2 * 60 * 60),
    )
}

fn open(dir: &TempDir, clock: &ManualClock) -> CacheManager<Analysis> {
    let store = FileStore::open(dir.path(), Some(1024 * 1024)).unwrap();
    CacheManager::with_clock(analysis_config(), Arc::new(store), Arc::new(clock.clone())).unwrap()
}

#[tokio::test]
async fn test_restart_comes_back_warm() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_700_000_000_000);
    let inputs: Vec<_> = (0..3).map(|i| json!({"image": format!("room-{i}")})).collect();

    {
        let cache = open(&dir, &clock);
        for (i, input) in inputs.iter().enumerate() {
            cache
                .get_or_set(
                    input,
                    move || async move {
                        Ok(Analysis {
                            style: format!("style-{i}"),
                            confidence: 0.9,
                        })
                    },
                    FetchOptions::default().with_cost(3.0),
                )
                .await
                .unwrap();
        }
    }

    clock.advance(Duration::from_secs(60));
    let cache = open(&dir, &clock);
    assert_eq!(cache.len(), 3);

    let calls = Arc::new(AtomicUsize::new(0));
    let c = calls.clone();
    let restored = cache
        .get_or_set(
            &inputs[1],
            move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("should be served from the rehydrated entry")
            },
            FetchOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(restored.style, "style-1");
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let key = cache.key_for(&inputs[1]).unwrap();
    let entry = cache.peek_entry(&key).unwrap();
    assert_eq!(entry.cost, 3.0);
    assert_eq!(entry.stored_at, clock.now_millis() - 60_000);
}

#[tokio::test]
async fn test_restart_purges_records_past_stale_window() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_700_000_000_000);

    {
        let cache = open(&dir, &clock);
        cache.set(
            "old",
            Analysis {
                style: "baroque".into(),
                confidence: 0.5,
            },
            1.0,
        );
    }

    clock.advance(Duration::from_secs(3 * 60 * 60));
    let cache = open(&dir, &clock);
    assert!(cache.is_empty());

    let store = FileStore::open(dir.path(), None).unwrap();
    assert!(store.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_restart_discards_unreadable_records() {
    let dir = TempDir::new().unwrap();
    let clock = ManualClock::new(1_700_000_000_000);
    {
        let store = FileStore::open(dir.path(), None).unwrap();
        store.set("ai-analysis:broken", "{not json").unwrap();
        store.set("ai-analysis:wrong-shape", r#"{"value": 1}"#).unwrap();
    }

    let cache = open(&dir, &clock);
    assert!(cache.is_empty());
    let store = FileStore::open(dir.path(), None).unwrap();
    assert!(store.keys().unwrap().is_empty());
}

#[tokio::test]
async fn test_batch_preload_bounds_concurrency() {
    let config = CacheConfig::new("preload", 50, Duration::from_secs(60), Duration::from_secs(60));
    let cache: CacheManager<u32> = CacheManager::new(config, Arc::new(MemoryStore::new())).unwrap();

    let in_flight = Arc::new(AtomicUsize::new(0));
    let max_in_flight = Arc::new(AtomicUsize::new(0));

    let requests = (0..10u32)
        .map(|i| {
            let in_flight = in_flight.clone();
            let max_in_flight = max_in_flight.clone();
            PreloadRequest::new(json!({"item": i}), move || async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_in_flight.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                if i == 4 {
                    anyhow::bail!("item {i} failed");
                }
                Ok(i * i)
            })
        })
        .collect();

    let results = cache.batch_preload(requests, 3).await;

    assert_eq!(results.len(), 10);
    assert_eq!(max_in_flight.load(Ordering::SeqCst), 3);
    for (i, result) in results.iter().enumerate() {
        assert_eq!(result.index, i);
        if i == 4 {
            assert!(result.outcome.is_err());
        } else {
            assert_eq!(*result.outcome.as_ref().unwrap(), (i * i) as u32);
        }
    }
    assert_eq!(cache.len(), 9);
}
