//! Action dispatch
//!
//! The engine never decides what a step does. It hands the step's action
//! name and parameters to an [`ActionDispatcher`] supplied by the host:
//! - [`ActionHandler`]: one named behavior, tagged with an [`ActionKind`]
//! - [`ActionRegistry`]: explicit name -> handler map (the usual dispatcher)
//! - [`CachingDispatcher`]: wraps a dispatcher with a [`stepflow_cache::ResponseCache`]
//! - [`builtin`]: small handlers used by the CLI host and tests

pub mod builtin;
mod cache;
mod registry;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dag::{Params, Payload};

pub use cache::CachingDispatcher;
pub use registry::{ActionRegistry, FnHandler};

/// Capability tag of a handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Talks to something outside the process
    NetworkCall,
    /// Pure function of its inputs
    DataTransform,
    /// Returns (a function of) its parameters without outside effects
    Passthrough,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::NetworkCall => write!(f, "network_call"),
            ActionKind::DataTransform => write!(f, "data_transform"),
            ActionKind::Passthrough => write!(f, "passthrough"),
        }
    }
}

/// Everything an action receives for one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionInput {
    pub step_id: String,
    /// 1-based attempt number
    pub attempt: u32,
    pub params: Params,
    /// Payloads of the step's direct dependencies, keyed by step id
    pub upstream: BTreeMap<String, Payload>,
    /// The plan's context/requirements metadata
    pub plan_context: Params,
}

impl ActionInput {
    pub fn new(step_id: impl Into<String>, params: Params) -> Self {
        Self {
            step_id: step_id.into(),
            attempt: 1,
            params,
            ..Default::default()
        }
    }
}

/// Failure reported by a dispatcher
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("{0}")]
    Failed(String),

    #[error("unknown action '{0}'")]
    UnknownAction(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),
}

/// Host-supplied execution primitive for step actions
#[async_trait]
pub trait ActionDispatcher: Send + Sync {
    /// Run `action` with the given input
    async fn dispatch(&self, action: &str, input: ActionInput) -> Result<Payload, ActionError>;

    /// Whether `action` can be dispatched; checked at plan submission
    fn supports(&self, _action: &str) -> bool {
        true
    }

    /// Whether results of `action` depend only on its parameters
    fn is_cacheable(&self, _action: &str) -> bool {
        false
    }
}

/// One named behavior
#[async_trait]
pub trait ActionHandler: Send + Sync {
    fn kind(&self) -> ActionKind;

    /// Results depend only on `params` and may be served from a cache
    fn cacheable(&self) -> bool {
        false
    }

    async fn call(&self, input: ActionInput) -> Result<Payload, ActionError>;
}
