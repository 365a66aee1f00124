//! Step runner
//!
//! Runs a single step invocation through the action dispatcher, bounded by
//! a timeout and the execution's cancellation token. Every way an
//! invocation can end becomes a [`StepOutcome`]; nothing escapes as a panic.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::action::{ActionDispatcher, ActionError, ActionInput};
use crate::dag::{Payload, Step};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepErrorKind {
    /// The action itself reported failure
    Action,
    Timeout,
    Cancelled,
    /// The action panicked or its worker vanished
    Panicked,
}

impl fmt::Display for StepErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepErrorKind::Action => write!(f, "action"),
            StepErrorKind::Timeout => write!(f, "timeout"),
            StepErrorKind::Cancelled => write!(f, "cancelled"),
            StepErrorKind::Panicked => write!(f, "panicked"),
        }
    }
}

/// Why one invocation failed
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct StepError {
    pub kind: StepErrorKind,
    pub message: String,
}

impl StepError {
    pub fn new(kind: StepErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            StepErrorKind::Timeout,
            format!("no result within {:.3}s", limit.as_secs_f64()),
        )
    }

    pub fn cancelled() -> Self {
        Self::new(StepErrorKind::Cancelled, "execution cancelled")
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(StepErrorKind::Panicked, message)
    }
}

impl From<ActionError> for StepError {
    fn from(err: ActionError) -> Self {
        Self::new(StepErrorKind::Action, err.to_string())
    }
}

/// Result of one step invocation
#[derive(Debug, Clone, PartialEq)]
pub struct StepOutcome {
    pub step_id: String,
    pub attempt: u32,
    pub success: bool,
    pub payload: Payload,
    pub error: Option<StepError>,
    pub elapsed: Duration,
}

impl StepOutcome {
    pub fn succeeded(step_id: impl Into<String>, attempt: u32, payload: Payload, elapsed: Duration) -> Self {
        Self {
            step_id: step_id.into(),
            attempt,
            success: true,
            payload,
            error: None,
            elapsed,
        }
    }

    pub fn failed(step_id: impl Into<String>, attempt: u32, error: StepError, elapsed: Duration) -> Self {
        Self {
            step_id: step_id.into(),
            attempt,
            success: false,
            payload: Payload::new(),
            error: Some(error),
            elapsed,
        }
    }
}

/// Executes single step invocations against a dispatcher
pub struct StepRunner {
    dispatcher: Arc<dyn ActionDispatcher>,
}

impl StepRunner {
    pub fn new(dispatcher: Arc<dyn ActionDispatcher>) -> Self {
        Self { dispatcher }
    }

    pub fn dispatcher(&self) -> &Arc<dyn ActionDispatcher> {
        &self.dispatcher
    }

    /// Run one attempt of `step`
    ///
    /// Resolves as soon as the action finishes, the timeout elapses or
    /// `cancel` fires, whichever comes first.
    pub async fn run(
        &self,
        step: &Step,
        input: ActionInput,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> StepOutcome {
        let attempt = input.attempt;
        let started = Instant::now();
        debug!(step_id = %step.id, attempt, action = %step.action, "Running step");

        let call = AssertUnwindSafe(self.dispatcher.dispatch(&step.action, input)).catch_unwind();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StepError::cancelled()),
            res = tokio::time::timeout(timeout, call) => match res {
                Ok(Ok(Ok(payload))) => Ok(payload),
                Ok(Ok(Err(e))) => Err(StepError::from(e)),
                Ok(Err(panic)) => Err(StepError::panicked(panic_message(panic.as_ref()))),
                Err(_) => Err(StepError::timeout(timeout)),
            },
        };

        let elapsed = started.elapsed();
        match result {
            Ok(payload) => StepOutcome::succeeded(&step.id, attempt, payload, elapsed),
            Err(error) => {
                debug!(step_id = %step.id, attempt, "Step attempt failed: {}", error);
                StepOutcome::failed(&step.id, attempt, error, elapsed)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("action panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("action panicked: {s}")
    } else {
        "action panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::builtin::builtin_registry;
    use crate::action::{ActionKind, ActionRegistry, FnHandler};
    use serde_json::json;

    fn runner() -> StepRunner {
        let registry = builtin_registry().with(
            "explode",
            FnHandler::new(ActionKind::Passthrough, |_input: ActionInput| async move {
                if true {
                    panic!("kaboom");
                }
                Ok(Payload::new())
            }),
        );
        StepRunner::new(Arc::new(registry))
    }

    fn input(step: &Step) -> ActionInput {
        ActionInput::new(&step.id, step.params.clone())
    }

    #[tokio::test]
    async fn test_success() {
        let step = Step::new("a", "passthrough").with_param("k", json!("v"));
        let outcome = runner()
            .run(&step, input(&step), Duration::from_secs(5), &CancellationToken::new())
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.payload["k"], json!("v"));
        assert!(outcome.error.is_none());
    }

    #[tokio::test]
    async fn test_action_failure() {
        let step = Step::new("a", "fail").with_param("message", json!("bad input"));
        let outcome = runner()
            .run(&step, input(&step), Duration::from_secs(5), &CancellationToken::new())
            .await;

        assert!(!outcome.success);
        let error = outcome.error.unwrap();
        assert_eq!(error.kind, StepErrorKind::Action);
        assert_eq!(error.message, "bad input");
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let step = Step::new("a", "sleep").with_param("ms", json!(10_000));
        let outcome = runner()
            .run(&step, input(&step), Duration::from_secs(1), &CancellationToken::new())
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.unwrap().kind, StepErrorKind::Timeout);
        assert!(outcome.elapsed < Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled() {
        let step = Step::new("a", "sleep").with_param("ms", json!(10_000));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let outcome = runner()
            .run(&step, input(&step), Duration::from_secs(60), &cancel)
            .await;

        assert_eq!(outcome.error.unwrap().kind, StepErrorKind::Cancelled);
    }

    #[tokio::test]
    async fn test_panic_is_captured() {
        let step = Step::new("a", "explode");
        let outcome = runner()
            .run(&step, input(&step), Duration::from_secs(5), &CancellationToken::new())
            .await;

        let error = outcome.error.unwrap();
        assert_eq!(error.kind, StepErrorKind::Panicked);
        assert!(error.message.contains("kaboom"));
    }

    #[test]
    fn test_step_error_display() {
        let err = StepError::from(ActionError::UnknownAction("x".to_string()));
        assert_eq!(err.to_string(), "action: unknown action 'x'");
    }
}
