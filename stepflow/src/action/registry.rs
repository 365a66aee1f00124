use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use super::{ActionDispatcher, ActionError, ActionHandler, ActionInput, ActionKind};
use crate::dag::Payload;

/// Explicit action name -> handler map
///
/// Dispatch is an exact name lookup. Plans naming an action that is not
/// registered are rejected at submission.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one under the same name
    pub fn register(&mut self, name: impl Into<String>, handler: impl ActionHandler + 'static) {
        self.handlers.insert(name.into(), Arc::new(handler));
    }

    pub fn with(mut self, name: impl Into<String>, handler: impl ActionHandler + 'static) -> Self {
        self.register(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<ActionKind> {
        self.handlers.get(name).map(|h| h.kind())
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}

#[async_trait]
impl ActionDispatcher for ActionRegistry {
    async fn dispatch(&self, action: &str, input: ActionInput) -> Result<Payload, ActionError> {
        let handler = self
            .get(action)
            .ok_or_else(|| ActionError::UnknownAction(action.to_string()))?;
        handler.call(input).await
    }

    fn supports(&self, action: &str) -> bool {
        self.contains(action)
    }

    fn is_cacheable(&self, action: &str) -> bool {
        self.handlers
            .get(action)
            .map(|h| h.cacheable())
            .unwrap_or(false)
    }
}

/// Handler backed by an async closure
pub struct FnHandler<F> {
    kind: ActionKind,
    cacheable: bool,
    f: F,
}

impl<F> FnHandler<F> {
    pub fn new<Fut>(kind: ActionKind, f: F) -> Self
    where
        F: Fn(ActionInput) -> Fut + Send + Sync,
        Fut: Future<Output = Result<Payload, ActionError>> + Send + 'static,
    {
        Self {
            kind,
            cacheable: false,
            f,
        }
    }

    pub fn with_cacheable(mut self, cacheable: bool) -> Self {
        self.cacheable = cacheable;
        self
    }
}

#[async_trait]
impl<F, Fut> ActionHandler for FnHandler<F>
where
    F: Fn(ActionInput) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Payload, ActionError>> + Send + 'static,
{
    fn kind(&self) -> ActionKind {
        self.kind
    }

    fn cacheable(&self) -> bool {
        self.cacheable
    }

    async fn call(&self, input: ActionInput) -> Result<Payload, ActionError> {
        (self.f)(input).await
    }
}
