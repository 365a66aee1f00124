//! Execution state
//!
//! [`PlanExecution`] is the live state of one run of a plan and is owned by
//! its scheduler. Everyone else sees [`PlanExecutionSnapshot`]s, immutable
//! copies published after every round.
//!
//! ```text
//! PENDING -> RUNNING -> COMPLETED
//!                    -> FAILED
//!    \___________\____-> CANCELLED
//! ```
//!
//! Terminal states are final.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dag::{Payload, Plan};
use crate::error::EngineError;
use crate::runner::StepError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Terminal failure of a step: its last error and how many attempts it took
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub error: StepError,
    pub attempts: u32,
}

/// Why an execution ended in FAILED
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FailureCause {
    RetriesExhausted {
        step_id: String,
        attempts: u32,
        last_error: String,
    },
    Deadlock {
        pending: usize,
    },
}

impl FailureCause {
    pub fn to_error(&self) -> EngineError {
        match self.clone() {
            FailureCause::RetriesExhausted {
                step_id,
                attempts,
                last_error,
            } => EngineError::RetriesExhausted {
                step_id,
                attempts,
                last_error,
            },
            FailureCause::Deadlock { pending } => EngineError::Deadlock { pending },
        }
    }
}

/// Live state of one plan run
#[derive(Debug, Clone)]
pub struct PlanExecution {
    pub id: String,
    pub plan: Plan,
    pub status: ExecutionStatus,
    pub completed: BTreeSet<String>,
    pub failed: BTreeMap<String, StepFailure>,
    pub results: BTreeMap<String, Payload>,
    /// Invocations started per step
    pub attempts: BTreeMap<String, u32>,
    pub rounds: u32,
    pub dispatches: u32,
    pub failure: Option<FailureCause>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PlanExecution {
    pub fn new(id: impl Into<String>, plan: Plan) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            plan,
            status: ExecutionStatus::Pending,
            completed: BTreeSet::new(),
            failed: BTreeMap::new(),
            results: BTreeMap::new(),
            attempts: BTreeMap::new(),
            rounds: 0,
            dispatches: 0,
            failure: None,
            error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn start(&mut self) {
        if self.status == ExecutionStatus::Pending {
            let now = Utc::now();
            self.status = ExecutionStatus::Running;
            self.started_at = Some(now);
            self.updated_at = now;
        }
    }

    /// Count a new invocation of `step_id`, returning its 1-based attempt number
    pub fn begin_attempt(&mut self, step_id: &str) -> u32 {
        let attempts = self.attempts.entry(step_id.to_string()).or_insert(0);
        *attempts += 1;
        self.dispatches += 1;
        *attempts
    }

    pub fn attempts_of(&self, step_id: &str) -> u32 {
        self.attempts.get(step_id).copied().unwrap_or(0)
    }

    /// Completed and failed ids only ever grow and never share an id
    pub fn mark_completed(&mut self, step_id: &str, payload: Payload) -> bool {
        if self.failed.contains_key(step_id) || !self.completed.insert(step_id.to_string()) {
            return false;
        }
        self.results.insert(step_id.to_string(), payload);
        self.touch();
        true
    }

    pub fn mark_failed(&mut self, step_id: &str, error: StepError) -> bool {
        if self.completed.contains(step_id) || self.failed.contains_key(step_id) {
            return false;
        }
        let attempts = self.attempts_of(step_id);
        self.failed
            .insert(step_id.to_string(), StepFailure { error, attempts });
        self.touch();
        true
    }

    pub fn failed_ids(&self) -> BTreeSet<String> {
        self.failed.keys().cloned().collect()
    }

    /// Steps neither completed nor failed
    pub fn outstanding(&self) -> usize {
        self.plan
            .len()
            .saturating_sub(self.completed.len() + self.failed.len())
    }

    /// Move to a terminal state; a no-op once terminal
    pub fn finish(&mut self, status: ExecutionStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        self.status = status;
        self.error = error;
        self.finished_at = Some(now);
        self.updated_at = now;
        true
    }

    pub fn fail(&mut self, cause: FailureCause) -> bool {
        let mut message = cause.to_error().to_string();
        let primary = match &cause {
            FailureCause::RetriesExhausted { step_id, .. } => Some(step_id.as_str()),
            FailureCause::Deadlock { .. } => None,
        };
        let others: Vec<String> = self
            .failed
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != primary)
            .map(|(id, failure)| format!("{id} ({})", failure.error))
            .collect();
        if !others.is_empty() {
            message.push_str(&format!("; also failed: {}", others.join(", ")));
        }
        if !self.finish(ExecutionStatus::Failed, Some(message)) {
            return false;
        }
        self.failure = Some(cause);
        true
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn snapshot(&self) -> PlanExecutionSnapshot {
        PlanExecutionSnapshot {
            execution_id: self.id.clone(),
            plan_id: self.plan.id.clone(),
            task: self.plan.task.clone(),
            status: self.status,
            step_order: self.plan.steps.iter().map(|s| s.id.clone()).collect(),
            completed: self.completed.clone(),
            failed: self.failed.clone(),
            results: self.results.clone(),
            attempts: self.attempts.clone(),
            rounds: self.rounds,
            dispatches: self.dispatches,
            failure: self.failure.clone(),
            error: self.error.clone(),
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            updated_at: self.updated_at,
        }
    }
}

/// Immutable copy of an execution's state at one point in time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanExecutionSnapshot {
    pub execution_id: String,
    pub plan_id: String,
    pub task: String,
    pub status: ExecutionStatus,
    /// Step ids in plan order
    pub step_order: Vec<String>,
    pub completed: BTreeSet<String>,
    pub failed: BTreeMap<String, StepFailure>,
    pub results: BTreeMap<String, Payload>,
    pub attempts: BTreeMap<String, u32>,
    pub rounds: u32,
    pub dispatches: u32,
    pub failure: Option<FailureCause>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl PlanExecutionSnapshot {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Step results on success, the reason otherwise
    pub fn outcome(&self) -> Result<&BTreeMap<String, Payload>, EngineError> {
        match self.status {
            ExecutionStatus::Completed => Ok(&self.results),
            ExecutionStatus::Failed => Err(match &self.failure {
                Some(cause) => cause.to_error(),
                None => EngineError::StepExecution {
                    step_id: self.failed.keys().next().cloned().unwrap_or_default(),
                    message: self.error.clone().unwrap_or_else(|| "execution failed".to_string()),
                },
            }),
            ExecutionStatus::Cancelled => Err(EngineError::Cancelled(self.execution_id.clone())),
            ExecutionStatus::Pending | ExecutionStatus::Running => {
                Err(EngineError::Unfinished(self.execution_id.clone()))
            }
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        let steps = self
            .step_order
            .iter()
            .map(|id| {
                let attempts = self.attempts.get(id).copied().unwrap_or(0);
                if let Some(payload) = self.results.get(id) {
                    StepReport {
                        step_id: id.clone(),
                        state: StepState::Completed,
                        attempts,
                        payload: Some(payload.clone()),
                        error: None,
                    }
                } else if let Some(failure) = self.failed.get(id) {
                    StepReport {
                        step_id: id.clone(),
                        state: StepState::Failed,
                        attempts: failure.attempts,
                        payload: None,
                        error: Some(failure.error.clone()),
                    }
                } else {
                    StepReport {
                        step_id: id.clone(),
                        state: StepState::Pending,
                        attempts,
                        payload: None,
                        error: None,
                    }
                }
            })
            .collect();

        let duration_ms = match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds()),
            _ => None,
        };

        ExecutionSummary {
            execution_id: self.execution_id.clone(),
            plan_id: self.plan_id.clone(),
            task: self.task.clone(),
            status: self.status,
            steps,
            results: self.results.clone(),
            failed: self.failed.clone(),
            error: self.error.clone(),
            rounds: self.rounds,
            dispatches: self.dispatches,
            duration_ms,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    pub step_id: String,
    pub state: StepState,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

/// Final report of an execution: every completed step's output keyed by id
/// and, on failure, the failed steps with their last errors
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub execution_id: String,
    pub plan_id: String,
    pub task: String,
    pub status: ExecutionStatus,
    pub steps: Vec<StepReport>,
    pub results: BTreeMap<String, Payload>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty", default)]
    pub failed: BTreeMap<String, StepFailure>,
    pub error: Option<String>,
    pub rounds: u32,
    pub dispatches: u32,
    pub duration_ms: Option<i64>,
}
