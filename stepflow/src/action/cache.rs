use std::sync::Arc;

use async_trait::async_trait;
use stepflow_cache::{cache_key, ResponseCache};
use tracing::{debug, warn};

use super::{ActionDispatcher, ActionError, ActionInput};
use crate::dag::{Params, Payload};

/// Dispatcher wrapper that memoizes cacheable actions
///
/// The key is the action name plus the canonical JSON of the step's params.
/// Upstream payloads are not part of the key, so only actions whose
/// dispatcher reports them as cacheable go through the cache. Cache failures
/// are logged and never fail a step.
pub struct CachingDispatcher<D> {
    inner: D,
    cache: Arc<ResponseCache>,
}

impl<D: ActionDispatcher> CachingDispatcher<D> {
    pub fn new(inner: D, cache: Arc<ResponseCache>) -> Self {
        Self { inner, cache }
    }

    pub fn inner(&self) -> &D {
        &self.inner
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    /// Key under which `action` with `params` is stored
    pub fn key_for(action: &str, params: &Params) -> Option<String> {
        // serde_json maps are ordered, so this serialization is canonical
        let params = serde_json::to_string(params).ok()?;
        Some(cache_key("action", &[action, &params]))
    }

    async fn lookup(&self, key: &str) -> Option<Payload> {
        let raw = self.cache.get(key).await?;
        match serde_json::from_str(&raw) {
            Ok(payload) => Some(payload),
            Err(e) => {
                warn!("Dropping undecodable cache entry {}: {}", key, e);
                self.cache.remove(key).await;
                None
            }
        }
    }

    async fn store(&self, key: String, action: &str, payload: &Payload) {
        let raw = match serde_json::to_string(payload) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Cannot serialize payload of '{}' for caching: {}", action, e);
                return;
            }
        };
        if let Err(e) = self
            .cache
            .insert_with_tags(key, raw, vec![action.to_string()])
            .await
        {
            debug!("Skipping cache insert for '{}': {}", action, e);
        }
    }
}

#[async_trait]
impl<D: ActionDispatcher> ActionDispatcher for CachingDispatcher<D> {
    async fn dispatch(&self, action: &str, input: ActionInput) -> Result<Payload, ActionError> {
        if !self.inner.is_cacheable(action) {
            return self.inner.dispatch(action, input).await;
        }
        let Some(key) = Self::key_for(action, &input.params) else {
            return self.inner.dispatch(action, input).await;
        };

        if let Some(payload) = self.lookup(&key).await {
            debug!(step_id = %input.step_id, "Cache hit for action '{}'", action);
            return Ok(payload);
        }

        let payload = self.inner.dispatch(action, input).await?;
        self.store(key, action, &payload).await;
        Ok(payload)
    }

    fn supports(&self, action: &str) -> bool {
        self.inner.supports(action)
    }

    fn is_cacheable(&self, action: &str) -> bool {
        self.inner.is_cacheable(action)
    }
}
