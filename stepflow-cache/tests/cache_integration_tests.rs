//! Integration tests for the response cache
//!
//! These tests exercise the public API end to end:
//! - Basic operations and statistics
//! - TTL expiration
//! - LRU eviction under entry and byte limits
//! - Tag invalidation
//! - Concurrent access through a shared handle

use std::sync::Arc;
use std::time::Duration;

use stepflow_cache::{cache_key, CacheConfig, CacheError, ResponseCache};

fn no_jitter() -> stepflow_cache::CacheConfigBuilder {
    CacheConfig::builder().ttl_jitter(0.0)
}

#[tokio::test]
async fn test_basic_cache_operations() {
    let cache = ResponseCache::new(no_jitter().max_entries(100).build());

    cache
        .insert("key1".to_string(), "value1".to_string())
        .await
        .unwrap();

    assert_eq!(cache.get("key1").await, Some("value1".to_string()));
    assert_eq!(cache.get("missing").await, None);

    let stats = cache.stats().await;
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.entries, 1);
    assert!((stats.hit_rate() - 50.0).abs() < f64::EPSILON);

    assert_eq!(cache.remove("key1").await, Some("value1".to_string()));
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_ttl_expiration() {
    let cache = ResponseCache::new(no_jitter().default_ttl(Duration::from_millis(50)).build());

    cache.insert("short".to_string(), "lived".to_string()).await.unwrap();
    assert!(cache.contains_key("short").await);

    tokio::time::sleep(Duration::from_millis(120)).await;

    assert!(!cache.contains_key("short").await);
    assert_eq!(cache.get("short").await, None);
    assert_eq!(cache.stats().await.evictions_ttl, 1);
}

#[tokio::test]
async fn test_cleanup_expired() {
    let cache = ResponseCache::new(no_jitter().default_ttl(Duration::from_millis(30)).build());

    for i in 0..5 {
        cache.insert(format!("k{}", i), "v".to_string()).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(80)).await;
    cache.insert("fresh".to_string(), "v".to_string()).await.unwrap();

    assert_eq!(cache.cleanup_expired().await, 5);
    assert_eq!(cache.len().await, 1);
}

#[tokio::test]
async fn test_auto_cleanup_task_purges_expired_entries() {
    let cache = Arc::new(ResponseCache::new(
        no_jitter()
            .default_ttl(Duration::from_millis(20))
            .cleanup_interval(Duration::from_millis(50))
            .build(),
    ));

    for i in 0..3 {
        cache.insert(format!("k{}", i), "v".to_string()).await.unwrap();
    }
    let task = tokio::spawn(stepflow_cache::start_auto_cleanup(Arc::clone(&cache)));

    tokio::time::sleep(Duration::from_millis(200)).await;
    task.abort();

    // nothing read the entries, so only the background sweep can have removed them
    assert_eq!(cache.len().await, 0);
    assert_eq!(cache.stats().await.evictions_ttl, 3);
}

#[tokio::test]
async fn test_lru_eviction_by_entry_count() {
    let cache = ResponseCache::new(no_jitter().max_entries(3).build());

    for key in ["a", "b", "c"] {
        cache.insert(key.to_string(), key.to_string()).await.unwrap();
    }
    // touch "a" so "b" becomes least recently used
    cache.get("a").await;
    cache.insert("d".to_string(), "d".to_string()).await.unwrap();

    assert_eq!(cache.len().await, 3);
    assert!(cache.contains_key("a").await);
    assert!(!cache.contains_key("b").await);
    assert!(cache.contains_key("d").await);
    assert!(cache.stats().await.total_evictions() >= 1);
}

#[tokio::test]
async fn test_replacing_entry_does_not_evict() {
    let cache = ResponseCache::new(no_jitter().max_entries(2).build());

    cache.insert("a".to_string(), "1".to_string()).await.unwrap();
    cache.insert("b".to_string(), "1".to_string()).await.unwrap();
    cache.insert("a".to_string(), "2".to_string()).await.unwrap();

    assert_eq!(cache.len().await, 2);
    assert_eq!(cache.get("a").await, Some("2".to_string()));
    assert!(cache.contains_key("b").await);
}

#[tokio::test]
async fn test_entry_too_large() {
    let cache = ResponseCache::new(no_jitter().max_size_bytes(64).build());

    let err = cache
        .insert("big".to_string(), "x".repeat(1024))
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::EntryTooLarge { .. }));
    assert!(cache.is_empty().await);
}

#[tokio::test]
async fn test_tag_invalidation() {
    let cache = ResponseCache::new(no_jitter().build());

    let fetch = cache_key("action", &["fetch", "{\"url\":\"a\"}"]);
    let other = cache_key("action", &["fetch", "{\"url\":\"b\"}"]);
    let pick = cache_key("action", &["json.pick", "{}"]);

    cache.insert_with_tags(fetch.clone(), "1".to_string(), vec!["fetch".to_string()]).await.unwrap();
    cache.insert_with_tags(other.clone(), "2".to_string(), vec!["fetch".to_string()]).await.unwrap();
    cache.insert_with_tags(pick.clone(), "3".to_string(), vec!["json.pick".to_string()]).await.unwrap();

    assert_eq!(cache.invalidate_by_tag("fetch").await, 2);
    assert!(!cache.contains_key(&fetch).await);
    assert!(cache.contains_key(&pick).await);
}

#[tokio::test]
async fn test_concurrent_access() {
    let cache = Arc::new(ResponseCache::new(no_jitter().max_entries(1000).build()));

    let mut handles = Vec::new();
    for worker in 0..8 {
        let cache = Arc::clone(&cache);
        handles.push(tokio::spawn(async move {
            for i in 0..50 {
                let key = format!("w{}:{}", worker, i);
                cache.insert(key.clone(), i.to_string()).await.unwrap();
                assert_eq!(cache.get(&key).await, Some(i.to_string()));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(cache.len().await, 400);
    assert_eq!(cache.stats().await.hits, 400);
}

#[tokio::test]
async fn test_clear() {
    let cache = ResponseCache::new(no_jitter().build());
    cache.insert("a".to_string(), "1".to_string()).await.unwrap();
    cache.insert("b".to_string(), "2".to_string()).await.unwrap();

    cache.clear().await;

    assert!(cache.is_empty().await);
    assert_eq!(cache.size_bytes().await, 0);
}
