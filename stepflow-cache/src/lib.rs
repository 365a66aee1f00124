//! # stepflow-cache
//!
//! A bounded, TTL-based response cache with LRU eviction.
//!
//! The cache is an explicitly constructed value: whoever needs one builds it
//! from a [`CacheConfig`] and owns it (usually behind an `Arc`). There is no
//! process-wide instance.
//!
//! ## Features
//!
//! - **TTL-Based Expiration**: entries expire after a configurable time-to-live,
//!   with optional jitter so entries written together do not expire together
//! - **Bounded Size**: limits on entry count and total bytes
//! - **LRU Eviction**: least recently used entries are evicted first
//! - **Tag Invalidation**: entries can be tagged and dropped by tag
//! - **Metrics**: hit/miss/eviction counters via [`CacheStats`]
//!
//! ## Example
//!
//! ```rust
//! use stepflow_cache::{CacheConfig, ResponseCache};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), stepflow_cache::CacheError> {
//! let config = CacheConfig::builder()
//!     .default_ttl(Duration::from_secs(600))
//!     .max_entries(1_000)
//!     .build();
//!
//! let cache = ResponseCache::new(config);
//!
//! cache.insert("action:fetch:{}".to_string(), "{\"ok\":true}".to_string()).await?;
//!
//! if let Some(value) = cache.get("action:fetch:{}").await {
//!     println!("Cache hit: {}", value);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod entry;
pub mod error;
pub mod store;
pub mod types;

pub use config::{CacheConfig, CacheConfigBuilder};
pub use entry::{CacheEntry, CacheMetadata};
pub use error::{CacheError, Result};
pub use store::{start_auto_cleanup, ResponseCache};
pub use types::{cache_key, CacheKey, CacheStats, CacheValue};
