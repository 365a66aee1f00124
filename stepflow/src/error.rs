//! Error types for plan execution
//!
//! Step-level failures (`StepExecution`) are handled by the scheduler's retry
//! loop and only become plan-level failures once retries are exhausted or a
//! structural problem is found.

use thiserror::Error;

use crate::recorder::RecorderError;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Unknown dependency, cyclic graph, unknown action or malformed step
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    /// A single step's action failed (recoverable up to its retry budget)
    #[error("Step {step_id} failed: {message}")]
    StepExecution { step_id: String, message: String },

    /// No runnable steps remain while work is outstanding
    #[error("Deadlock detected: {pending} step(s) can never become runnable")]
    Deadlock { pending: usize },

    /// A step failed on every allowed attempt
    #[error("Step {step_id} exhausted {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        step_id: String,
        attempts: u32,
        last_error: String,
    },

    /// Execution stopped by explicit request
    #[error("Execution {0} was cancelled")]
    Cancelled(String),

    #[error("Recorder error: {0}")]
    Recorder(#[from] RecorderError),

    /// Result requested before the execution reached a terminal state
    #[error("Execution {0} has not finished")]
    Unfinished(String),

    #[error("Execution not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The registry's worker pool is no longer accepting jobs
    #[error("Engine is shut down")]
    Shutdown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    pub fn invalid_plan(reason: impl Into<String>) -> Self {
        EngineError::InvalidPlan(reason.into())
    }

    pub fn is_invalid_plan(&self) -> bool {
        matches!(self, EngineError::InvalidPlan(_))
    }
}
