//! Cache store with TTL expiry and LRU eviction

use crate::config::CacheConfig;
use crate::entry::CacheEntry;
use crate::error::{CacheError, Result};
use crate::types::{CacheKey, CacheStats, CacheValue};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Bounded response cache with TTL support and LRU eviction
///
/// - Thread-safe async access via RwLock
/// - TTL-based expiration checked on read and by [`ResponseCache::cleanup_expired`]
/// - LRU eviction when the entry or byte limit is reached
pub struct ResponseCache {
    config: CacheConfig,
    store: Arc<RwLock<CacheStore>>,
}

struct CacheStore {
    entries: HashMap<CacheKey, CacheEntry>,

    /// Access order, least recently used first
    lru_queue: VecDeque<CacheKey>,

    stats: CacheStats,

    current_size_bytes: usize,
}

impl ResponseCache {
    pub fn new(config: CacheConfig) -> Self {
        debug!("Initializing response cache with config: {:?}", config);

        let store = CacheStore {
            entries: HashMap::new(),
            lru_queue: VecDeque::new(),
            stats: CacheStats::default(),
            current_size_bytes: 0,
        };

        Self {
            config,
            store: Arc::new(RwLock::new(store)),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Insert a value into the cache
    pub async fn insert(&self, key: CacheKey, value: CacheValue) -> Result<()> {
        self.insert_with_tags(key, value, Vec::new()).await
    }

    /// Insert a value into the cache with tags
    pub async fn insert_with_tags(
        &self,
        key: CacheKey,
        value: CacheValue,
        tags: Vec<String>,
    ) -> Result<()> {
        let ttl = self.config.ttl_with_jitter();
        let mut entry = CacheEntry::new(key.clone(), value, ttl);
        for tag in tags {
            entry.add_tag(tag);
        }

        let size = entry.metadata.size_bytes;
        if size > self.config.max_size_bytes {
            return Err(CacheError::EntryTooLarge {
                size_bytes: size,
                max_size_bytes: self.config.max_size_bytes,
            });
        }

        let mut store = self.store.write().await;

        // Replacing an entry frees its slot before the limits are checked
        Self::remove_entry(&mut store, &key);
        self.evict_if_needed(&mut store, size);

        debug!("Inserting cache entry: {}", key);
        store.entries.insert(key.clone(), entry);
        store.lru_queue.push_back(key);
        store.current_size_bytes += size;

        self.update_stats(&mut store);

        Ok(())
    }

    /// Get a value from the cache
    pub async fn get(&self, key: &str) -> Option<CacheValue> {
        let mut store = self.store.write().await;

        let expired = match store.entries.get(key) {
            Some(entry) => entry.is_expired(),
            None => {
                debug!("Cache miss: {}", key);
                store.stats.misses += 1;
                return None;
            }
        };

        if expired {
            debug!("Cache entry expired: {}", key);
            store.stats.misses += 1;
            store.stats.evictions_ttl += 1;
            Self::remove_entry(&mut store, key);
            self.update_stats(&mut store);
            return None;
        }

        let value = store.entries.get_mut(key).map(|entry| {
            entry.mark_accessed();
            entry.value.clone()
        });
        store.stats.hits += 1;

        if self.config.enable_lru_eviction {
            store.lru_queue.retain(|k| k != key);
            store.lru_queue.push_back(key.to_string());
        }

        debug!("Cache hit: {}", key);
        value
    }

    /// Check if a live key exists (without updating access time)
    pub async fn contains_key(&self, key: &str) -> bool {
        let store = self.store.read().await;
        store
            .entries
            .get(key)
            .map(|entry| !entry.is_expired())
            .unwrap_or(false)
    }

    /// Remove a specific entry from the cache
    pub async fn remove(&self, key: &str) -> Option<CacheValue> {
        let mut store = self.store.write().await;
        let removed = Self::remove_entry(&mut store, key);
        if removed.is_some() {
            store.stats.invalidations += 1;
            self.update_stats(&mut store);
            debug!("Removed cache entry: {}", key);
        }
        removed.map(|entry| entry.value)
    }

    /// Clear all entries from the cache
    pub async fn clear(&self) {
        let mut store = self.store.write().await;

        let count = store.entries.len();
        store.entries.clear();
        store.lru_queue.clear();
        store.current_size_bytes = 0;
        store.stats.invalidations += count as u64;
        self.update_stats(&mut store);

        info!("Cleared {} entries from cache", count);
    }

    /// Remove all expired entries, returning how many were dropped
    pub async fn cleanup_expired(&self) -> usize {
        let mut store = self.store.write().await;

        let expired_keys: Vec<CacheKey> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired_keys {
            Self::remove_entry(&mut store, key);
        }

        if !expired_keys.is_empty() {
            store.stats.evictions_ttl += expired_keys.len() as u64;
            self.update_stats(&mut store);
            debug!("Cleaned up {} expired entries", expired_keys.len());
        }

        expired_keys.len()
    }

    /// Invalidate entries by tag
    pub async fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut store = self.store.write().await;

        let keys_to_remove: Vec<CacheKey> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.has_tag(tag))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &keys_to_remove {
            Self::remove_entry(&mut store, key);
        }

        store.stats.invalidations += keys_to_remove.len() as u64;
        self.update_stats(&mut store);
        debug!("Invalidated {} entries with tag: {}", keys_to_remove.len(), tag);

        keys_to_remove.len()
    }

    pub async fn stats(&self) -> CacheStats {
        self.store.read().await.stats.clone()
    }

    pub async fn size_bytes(&self) -> usize {
        self.store.read().await.current_size_bytes
    }

    pub async fn len(&self) -> usize {
        self.store.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.store.read().await.entries.is_empty()
    }

    fn remove_entry(store: &mut CacheStore, key: &str) -> Option<CacheEntry> {
        let entry = store.entries.remove(key)?;
        store.lru_queue.retain(|k| k != key);
        store.current_size_bytes = store
            .current_size_bytes
            .saturating_sub(entry.metadata.size_bytes);
        Some(entry)
    }

    /// Evict least recently used entries until `needed_size` more bytes and
    /// one more entry fit
    fn evict_if_needed(&self, store: &mut CacheStore, needed_size: usize) {
        while store.entries.len() >= self.config.max_entries
            || store.current_size_bytes + needed_size > self.config.max_size_bytes
        {
            let Some(key) = store.lru_queue.pop_front() else {
                warn!("Eviction queue empty while cache is over its limits");
                break;
            };
            debug!("Evicting entry: {}", key);
            Self::remove_entry(store, &key);
            store.stats.evictions_size += 1;
        }
    }

    fn update_stats(&self, store: &mut CacheStore) {
        if self.config.enable_metrics {
            store.stats.entries = store.entries.len();
            store.stats.size_bytes = store.current_size_bytes;
        }
    }
}

/// Background task for periodic cleanup of expired entries
pub async fn start_auto_cleanup(cache: Arc<ResponseCache>) {
    let interval = cache.config.cleanup_interval;

    info!("Starting cache cleanup task (interval: {:?})", interval);

    loop {
        tokio::time::sleep(interval).await;

        let removed = cache.cleanup_expired().await;
        if removed > 0 {
            debug!("Auto cleanup removed {} entries", removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_basic_insert_and_get() {
        let config = CacheConfig::builder()
            .default_ttl(Duration::from_secs(60))
            .max_entries(100)
            .build();

        let cache = ResponseCache::new(config);

        cache
            .insert("key1".to_string(), "value1".to_string())
            .await
            .unwrap();

        let value = cache.get("key1").await;
        assert_eq!(value, Some("value1".to_string()));

        let stats = cache.stats().await;
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_cache_miss() {
        let cache = ResponseCache::new(CacheConfig::default());

        assert_eq!(cache.get("nonexistent").await, None);
        assert_eq!(cache.stats().await.misses, 1);
    }

    #[tokio::test]
    async fn test_ttl_expiration() {
        let config = CacheConfig::builder()
            .default_ttl(Duration::from_millis(50))
            .ttl_jitter(0.0)
            .build();

        let cache = ResponseCache::new(config);

        cache
            .insert("key1".to_string(), "value1".to_string())
            .await
            .unwrap();
        assert!(cache.get("key1").await.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(cache.get("key1").await.is_none());
        let stats = cache.stats().await;
        assert_eq!(stats.evictions_ttl, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let config = CacheConfig::builder()
            .default_ttl(Duration::from_secs(60))
            .max_entries(3)
            .enable_lru_eviction(true)
            .build();

        let cache = ResponseCache::new(config);

        for i in 1..=3 {
            cache
                .insert(format!("key{}", i), format!("value{}", i))
                .await
                .unwrap();
        }

        // Touch key1 so key2 becomes least recently used
        assert!(cache.get("key1").await.is_some());

        cache
            .insert("key4".to_string(), "value4".to_string())
            .await
            .unwrap();

        assert!(cache.get("key2").await.is_none());
        assert!(cache.get("key1").await.is_some());
        assert!(cache.get("key3").await.is_some());
        assert!(cache.get("key4").await.is_some());
        assert_eq!(cache.len().await, 3);
        assert_eq!(cache.stats().await.evictions_size, 1);
    }

    #[tokio::test]
    async fn test_replace_does_not_evict() {
        let config = CacheConfig::builder().max_entries(2).build();
        let cache = ResponseCache::new(config);

        cache.insert("a".to_string(), "1".to_string()).await.unwrap();
        cache.insert("b".to_string(), "2".to_string()).await.unwrap();
        cache.insert("a".to_string(), "3".to_string()).await.unwrap();

        assert_eq!(cache.len().await, 2);
        assert_eq!(cache.get("a").await, Some("3".to_string()));
        assert_eq!(cache.get("b").await, Some("2".to_string()));
        assert_eq!(cache.stats().await.evictions_size, 0);
    }

    #[tokio::test]
    async fn test_entry_too_large() {
        let config = CacheConfig::builder().max_size_bytes(16).build();
        let cache = ResponseCache::new(config);

        let result = cache.insert("big".to_string(), "x".repeat(64)).await;
        assert!(matches!(result, Err(CacheError::EntryTooLarge { .. })));
        assert!(cache.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_and_clear() {
        let cache = ResponseCache::new(CacheConfig::default());

        cache.insert("key1".to_string(), "value1".to_string()).await.unwrap();
        cache.insert("key2".to_string(), "value2".to_string()).await.unwrap();

        assert_eq!(cache.remove("key1").await, Some("value1".to_string()));
        assert_eq!(cache.remove("key1").await, None);

        cache.clear().await;
        assert!(cache.is_empty().await);
        assert_eq!(cache.size_bytes().await, 0);
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let config = CacheConfig::builder()
            .default_ttl(Duration::from_millis(30))
            .ttl_jitter(0.0)
            .build();

        let cache = ResponseCache::new(config);

        cache.insert("key1".to_string(), "value1".to_string()).await.unwrap();
        cache.insert("key2".to_string(), "value2".to_string()).await.unwrap();

        tokio::time::sleep(Duration::from_millis(80)).await;

        assert_eq!(cache.cleanup_expired().await, 2);
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn test_invalidate_by_tag() {
        let cache = ResponseCache::new(CacheConfig::default());

        cache
            .insert_with_tags("a".to_string(), "1".to_string(), vec!["sleep".to_string()])
            .await
            .unwrap();
        cache
            .insert_with_tags("b".to_string(), "2".to_string(), vec!["json.pick".to_string()])
            .await
            .unwrap();

        assert_eq!(cache.invalidate_by_tag("sleep").await, 1);
        assert!(!cache.contains_key("a").await);
        assert!(cache.contains_key("b").await);
    }
}
