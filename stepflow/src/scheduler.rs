//! Round-based plan scheduler
//!
//! One scheduler drives one execution from RUNNING to a terminal state:
//!
//! 1. compute the runnable set (dependencies completed, not yet finished)
//! 2. drop steps still waiting out a retry backoff
//! 3. dispatch the rest concurrently, longest estimate first, capped at
//!    `max_in_flight`
//! 4. wait for every dispatched step (round barrier)
//! 5. apply results: completions, retry scheduling, terminal failures
//! 6. publish a snapshot
//!
//! The scheduler task is the only writer of its [`PlanExecution`]. Step
//! tasks report through a per-round channel and observers read published
//! snapshots.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::ActionInput;
use crate::config::EngineConfig;
use crate::dag::{DependencyGraph, Plan, Step};
use crate::error::EngineError;
use crate::execution::{ExecutionStatus, FailureCause, PlanExecution, PlanExecutionSnapshot};
use crate::recorder::{record_best_effort, ExecutionRecord, ExecutionRecorder};
use crate::retry::RetryController;
use crate::runner::{StepError, StepErrorKind, StepOutcome, StepRunner};

/// Scheduler knobs taken from [`EngineConfig`]
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    pub max_in_flight: usize,
    pub default_step_timeout: Duration,
    pub max_backoff: Option<Duration>,
    pub record_step_events: bool,
}

impl From<&EngineConfig> for SchedulerSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight.max(1),
            default_step_timeout: config.default_step_timeout,
            max_backoff: config.max_backoff,
            record_step_events: config.record_step_events,
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

enum Conclusion {
    Completed,
    Failed(FailureCause),
    Cancelled,
}

pub struct PlanScheduler {
    execution: PlanExecution,
    graph: DependencyGraph,
    steps: HashMap<String, Step>,
    runner: Arc<StepRunner>,
    recorder: Arc<dyn ExecutionRecorder>,
    retry: RetryController,
    settings: SchedulerSettings,
    cancel: CancellationToken,
    publisher: Arc<watch::Sender<PlanExecutionSnapshot>>,
}

impl PlanScheduler {
    /// `graph` must have been built from `plan`
    pub fn new(
        execution_id: impl Into<String>,
        plan: Plan,
        graph: DependencyGraph,
        runner: Arc<StepRunner>,
        recorder: Arc<dyn ExecutionRecorder>,
        settings: SchedulerSettings,
    ) -> Self {
        let steps = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        let execution = PlanExecution::new(execution_id, plan);
        let (publisher, _) = watch::channel(execution.snapshot());
        let retry = RetryController::new().with_max_delay(settings.max_backoff);

        Self {
            execution,
            graph,
            steps,
            runner,
            recorder,
            retry,
            settings,
            cancel: CancellationToken::new(),
            publisher: Arc::new(publisher),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution.id
    }

    pub fn subscribe(&self) -> watch::Receiver<PlanExecutionSnapshot> {
        self.publisher.subscribe()
    }

    pub fn publisher(&self) -> Arc<watch::Sender<PlanExecutionSnapshot>> {
        Arc::clone(&self.publisher)
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Drive the execution to a terminal state and return the final snapshot
    pub async fn run(mut self) -> PlanExecutionSnapshot {
        if self.cancel.is_cancelled() {
            return self.conclude(Conclusion::Cancelled).await;
        }

        self.execution.start();
        self.publish();
        info!(
            execution_id = %self.execution.id,
            plan_id = %self.execution.plan.id,
            steps = self.graph.len(),
            "Starting plan execution"
        );

        loop {
            if self.cancel.is_cancelled() {
                return self.conclude(Conclusion::Cancelled).await;
            }

            let runnable = self
                .graph
                .runnable(&self.execution.completed, &self.execution.failed_ids());
            if runnable.is_empty() {
                let pending = self.execution.outstanding();
                if pending > 0 {
                    return self
                        .conclude(Conclusion::Failed(FailureCause::Deadlock { pending }))
                        .await;
                }
                break;
            }

            let now = Instant::now();
            let mut batch: Vec<Step> = runnable
                .iter()
                .filter(|id| self.retry.is_eligible(id, now))
                .filter_map(|id| self.steps.get(id).cloned())
                .collect();

            if batch.is_empty() {
                // everything runnable is backing off
                let wake = self
                    .retry
                    .earliest_eligible(&runnable, now)
                    .unwrap_or(now);
                debug!(execution_id = %self.execution.id, "Waiting {:?} for backoff", wake - now);
                tokio::select! {
                    _ = self.cancel.cancelled() => {}
                    _ = tokio::time::sleep_until(wake) => {}
                }
                continue;
            }

            order_for_dispatch(&mut batch);
            batch.truncate(self.settings.max_in_flight);

            let outcomes = self.dispatch_round(batch).await;
            if self.cancel.is_cancelled() {
                debug!(execution_id = %self.execution.id, "Discarding results of cancelled round");
                return self.conclude(Conclusion::Cancelled).await;
            }

            if let Some(cause) = self.apply_outcomes(outcomes).await {
                return self.conclude(Conclusion::Failed(cause)).await;
            }
            self.publish();
        }

        if self.execution.failed.is_empty() {
            self.conclude(Conclusion::Completed).await
        } else {
            let pending = self.execution.outstanding();
            self.conclude(Conclusion::Failed(FailureCause::Deadlock { pending }))
                .await
        }
    }

    /// Run one round and wait for every step in it
    async fn dispatch_round(&mut self, batch: Vec<Step>) -> Vec<StepOutcome> {
        self.execution.rounds += 1;
        let round = self.execution.rounds;
        debug!(
            execution_id = %self.execution.id,
            round,
            steps = batch.len(),
            "Dispatching round"
        );

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut expected = Vec::with_capacity(batch.len());

        for step in batch {
            let attempt = self.execution.begin_attempt(&step.id);
            let input = self.input_for(&step, attempt);
            let timeout = step.timeout().unwrap_or(self.settings.default_step_timeout);
            let runner = Arc::clone(&self.runner);
            let cancel = self.cancel.clone();
            let tx = tx.clone();
            expected.push((step.id.clone(), attempt));

            tokio::spawn(async move {
                let outcome = runner.run(&step, input, timeout, &cancel).await;
                // the receiver only goes away if the scheduler itself is gone
                let _ = tx.send(outcome);
            });
        }
        drop(tx);
        self.publish();

        let mut outcomes = Vec::with_capacity(expected.len());
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        // a step task that died without reporting
        for (step_id, attempt) in &expected {
            if !outcomes.iter().any(|o| &o.step_id == step_id) {
                outcomes.push(StepOutcome::failed(
                    step_id,
                    *attempt,
                    StepError::panicked("step task exited without reporting a result"),
                    Duration::ZERO,
                ));
            }
        }

        let position: HashMap<&str, usize> = self
            .execution
            .plan
            .steps
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.as_str(), i))
            .collect();
        outcomes.sort_by_key(|o| position.get(o.step_id.as_str()).copied().unwrap_or(usize::MAX));
        outcomes
    }

    /// Fold one round's results into the execution
    ///
    /// Returns the failure cause if some step ran out of attempts.
    async fn apply_outcomes(&mut self, outcomes: Vec<StepOutcome>) -> Option<FailureCause> {
        let mut exhausted = None;

        for outcome in outcomes {
            if self.settings.record_step_events {
                let record = ExecutionRecord::step(&self.execution, &outcome);
                record_best_effort(self.recorder.as_ref(), record).await;
            }

            if outcome.success {
                debug!(
                    execution_id = %self.execution.id,
                    step_id = %outcome.step_id,
                    attempt = outcome.attempt,
                    "Step completed in {:?}", outcome.elapsed
                );
                self.execution.mark_completed(&outcome.step_id, outcome.payload);
                continue;
            }

            let Some(step) = self.steps.get(&outcome.step_id) else {
                continue;
            };
            let err = outcome
                .error
                .unwrap_or_else(|| StepError::new(StepErrorKind::Action, "step failed"));

            match self.retry.record_failure(step, Instant::now()) {
                Some(delay) => warn!(
                    execution_id = %self.execution.id,
                    step_id = %step.id,
                    attempt = outcome.attempt,
                    "Step failed, retrying in {:?}: {}", delay, err
                ),
                None => {
                    error!(
                        execution_id = %self.execution.id,
                        step_id = %step.id,
                        attempt = outcome.attempt,
                        "Step failed on its final attempt: {}", err
                    );
                    if exhausted.is_none() {
                        exhausted = Some(FailureCause::RetriesExhausted {
                            step_id: step.id.clone(),
                            attempts: outcome.attempt,
                            last_error: err.to_string(),
                        });
                    }
                    self.execution.mark_failed(&outcome.step_id, err);
                }
            }
        }

        exhausted
    }

    fn input_for(&self, step: &Step, attempt: u32) -> ActionInput {
        let upstream = self
            .graph
            .dependencies(&step.id)
            .into_iter()
            .filter_map(|dep| {
                self.execution
                    .results
                    .get(dep)
                    .map(|payload| (dep.to_string(), payload.clone()))
            })
            .collect();

        ActionInput {
            step_id: step.id.clone(),
            attempt,
            params: step.params.clone(),
            upstream,
            plan_context: self.execution.plan.context.clone(),
        }
    }

    /// Align the live state with the published terminal snapshot
    fn adopt(&mut self, published: &PlanExecutionSnapshot) {
        self.execution.status = published.status;
        self.execution.error = published.error.clone();
        self.execution.failure = published.failure.clone();
        self.execution.finished_at = published.finished_at;
        self.execution.updated_at = published.updated_at;
    }

    /// Publish the current state unless a terminal status is already out
    fn publish(&self) -> bool {
        let snapshot = self.execution.snapshot();
        self.publisher.send_if_modified(|current| {
            if current.status.is_terminal() {
                return false;
            }
            *current = snapshot;
            true
        })
    }

    async fn conclude(mut self, conclusion: Conclusion) -> PlanExecutionSnapshot {
        match conclusion {
            Conclusion::Completed => {
                self.execution.finish(ExecutionStatus::Completed, None);
            }
            Conclusion::Failed(cause) => {
                self.execution.fail(cause);
            }
            Conclusion::Cancelled => {
                let reason = EngineError::Cancelled(self.execution.id.clone()).to_string();
                self.execution.finish(ExecutionStatus::Cancelled, Some(reason));
            }
        }

        // A terminal snapshot already out (a cancel) is final; adopt it as is
        let mut snapshot = self.execution.snapshot();
        self.publisher.send_if_modified(|current| {
            if current.status.is_terminal() {
                snapshot = current.clone();
                return false;
            }
            *current = snapshot.clone();
            true
        });
        self.adopt(&snapshot);

        match self.execution.status {
            ExecutionStatus::Completed => info!(
                execution_id = %self.execution.id,
                rounds = self.execution.rounds,
                dispatches = self.execution.dispatches,
                "Plan execution completed"
            ),
            ExecutionStatus::Cancelled => info!(
                execution_id = %self.execution.id,
                "Plan execution cancelled"
            ),
            status => error!(
                execution_id = %self.execution.id,
                status = %status,
                "Plan execution failed: {}",
                self.execution.error.as_deref().unwrap_or("unknown error")
            ),
        }

        let record = ExecutionRecord::plan_finished(&self.execution);
        record_best_effort(self.recorder.as_ref(), record).await;

        snapshot
    }
}

/// Mark a published execution cancelled and fire its token
///
/// Returns false when the published status was already terminal, in which
/// case nothing changes.
pub fn request_cancel(
    publisher: &watch::Sender<PlanExecutionSnapshot>,
    token: &CancellationToken,
) -> bool {
    let accepted = publisher.send_if_modified(|current| {
        if current.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        current.status = ExecutionStatus::Cancelled;
        current.error = Some(EngineError::Cancelled(current.execution_id.clone()).to_string());
        current.finished_at = Some(now);
        current.updated_at = now;
        true
    });
    if accepted {
        token.cancel();
    }
    accepted
}

/// Mark a published execution failed after its scheduler died mid-run
///
/// Returns false when the published status was already terminal.
pub fn publish_aborted(publisher: &watch::Sender<PlanExecutionSnapshot>, reason: &str) -> bool {
    publisher.send_if_modified(|current| {
        if current.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        current.status = ExecutionStatus::Failed;
        current.error = Some(format!("scheduler aborted: {reason}"));
        current.finished_at = Some(now);
        current.updated_at = now;
        true
    })
}

/// Longest estimated duration first; the sort is stable so ties keep plan order
fn order_for_dispatch(batch: &mut [Step]) {
    batch.sort_by(|a, b| {
        b.estimated_duration
            .partial_cmp(&a.estimated_duration)
            .unwrap_or(Ordering::Equal)
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::builtin::builtin_registry;
    use crate::recorder::{MemoryRecorder, RecordKind};
    use serde_json::json;

    fn scheduler(plan: Plan, recorder: MemoryRecorder) -> PlanScheduler {
        let graph = DependencyGraph::from_plan(&plan).unwrap();
        let runner = Arc::new(StepRunner::new(Arc::new(builtin_registry())));
        PlanScheduler::new(
            "exec-test",
            plan,
            graph,
            runner,
            Arc::new(recorder),
            SchedulerSettings::default(),
        )
    }

    #[test]
    fn test_order_for_dispatch() {
        let mut batch = vec![
            Step::new("a", "passthrough").with_estimated_duration(1.0),
            Step::new("b", "passthrough").with_estimated_duration(5.0),
            Step::new("c", "passthrough").with_estimated_duration(1.0),
            Step::new("d", "passthrough"),
        ];
        order_for_dispatch(&mut batch);
        let ids: Vec<_> = batch.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c", "d"]);
    }

    #[tokio::test]
    async fn test_upstream_payloads_reach_dependents() {
        let plan = Plan::new("merge")
            .with_step(Step::new("x", "passthrough").with_param("a", json!(1)))
            .with_step(Step::new("y", "passthrough").with_param("b", json!(2)))
            .with_step(
                Step::new("m", "json.merge")
                    .depends_on("x")
                    .depends_on("y")
                    .with_param("c", json!(3)),
            );
        let snapshot = scheduler(plan, MemoryRecorder::new()).run().await;

        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(
            serde_json::Value::Object(snapshot.results["m"].clone()),
            json!({"a": 1, "b": 2, "c": 3})
        );
        assert_eq!(snapshot.rounds, 2);
    }

    #[tokio::test]
    async fn test_records_step_events_and_final_outcome() {
        let recorder = MemoryRecorder::new();
        let plan = Plan::new("two")
            .with_step(Step::new("a", "passthrough"))
            .with_step(Step::new("b", "passthrough").depends_on("a"));
        scheduler(plan, recorder.clone()).run().await;

        let kinds: Vec<_> = recorder.records().await.iter().map(|r| r.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RecordKind::StepCompleted,
                RecordKind::StepCompleted,
                RecordKind::PlanFinished
            ]
        );
    }

    #[tokio::test]
    async fn test_cancel_before_run_dispatches_nothing() {
        let recorder = MemoryRecorder::new();
        let plan = Plan::new("one").with_step(Step::new("a", "passthrough"));
        let scheduler = scheduler(plan, recorder.clone());
        let publisher = scheduler.publisher();

        assert!(request_cancel(&publisher, &scheduler.cancel_token()));
        assert!(!request_cancel(&publisher, &scheduler.cancel_token()));

        let snapshot = scheduler.run().await;
        assert_eq!(snapshot.status, ExecutionStatus::Cancelled);
        assert_eq!(snapshot.dispatches, 0);
        assert_eq!(recorder.len().await, 1);
    }

    #[tokio::test]
    async fn test_conclude_keeps_published_cancel_snapshot() {
        let plan = Plan::new("one").with_step(Step::new("a", "passthrough"));
        let scheduler = scheduler(plan, MemoryRecorder::new());
        let publisher = scheduler.publisher();
        let observer = scheduler.subscribe();

        request_cancel(&publisher, &scheduler.cancel_token());
        let published = observer.borrow().clone();

        let returned = scheduler.run().await;
        assert_eq!(*observer.borrow(), published);
        assert_eq!(returned, published);
    }

    #[test]
    fn test_publish_aborted_only_from_live_state() {
        let plan = Plan::new("one").with_step(Step::new("a", "passthrough"));
        let execution = PlanExecution::new("exec-x", plan);
        let (publisher, observer) = watch::channel(execution.snapshot());

        assert!(publish_aborted(&publisher, "boom"));
        assert_eq!(observer.borrow().status, ExecutionStatus::Failed);
        assert!(observer.borrow().error.as_deref().unwrap_or("").contains("boom"));

        assert!(!publish_aborted(&publisher, "again"));
        assert!(!request_cancel(&publisher, &CancellationToken::new()));
    }

    #[tokio::test]
    async fn test_empty_plan_completes() {
        let snapshot = scheduler(Plan::new("nothing"), MemoryRecorder::new()).run().await;
        assert_eq!(snapshot.status, ExecutionStatus::Completed);
        assert_eq!(snapshot.rounds, 0);
    }
}
