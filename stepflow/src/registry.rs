//! Task registry
//!
//! Accepts plans, queues their execution on a fixed pool of worker tasks and
//! answers status queries by execution id. Executions stay queryable until
//! they have been terminal for longer than the configured retention.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::ActionDispatcher;
use crate::config::EngineConfig;
use crate::dag::{short_id, DependencyGraph, Plan};
use crate::error::{EngineError, Result};
use crate::execution::{ExecutionStatus, PlanExecutionSnapshot};
use crate::recorder::ExecutionRecorder;
use crate::runner::StepRunner;
use crate::scheduler::{publish_aborted, request_cancel, PlanScheduler, SchedulerSettings};

struct ExecutionEntry {
    snapshot: watch::Receiver<PlanExecutionSnapshot>,
    publisher: Arc<watch::Sender<PlanExecutionSnapshot>>,
    cancel: CancellationToken,
}

/// Listing entry for one retained execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInfo {
    pub execution_id: String,
    pub plan_id: String,
    pub task: String,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct TaskRegistry {
    executions: RwLock<HashMap<String, ExecutionEntry>>,
    jobs: Mutex<Option<mpsc::UnboundedSender<PlanScheduler>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    dispatcher: Arc<dyn ActionDispatcher>,
    runner: Arc<StepRunner>,
    recorder: Arc<dyn ExecutionRecorder>,
    config: EngineConfig,
}

impl TaskRegistry {
    /// Start a registry and its worker pool; must be called inside a tokio runtime
    pub fn new(
        config: EngineConfig,
        dispatcher: Arc<dyn ActionDispatcher>,
        recorder: Arc<dyn ExecutionRecorder>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::unbounded_channel::<PlanScheduler>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..config.workers)
            .map(|worker_id| {
                let rx = Arc::clone(&rx);
                tokio::spawn(async move {
                    loop {
                        let job = {
                            let mut rx = rx.lock().await;
                            rx.recv().await
                        };
                        let Some(scheduler) = job else {
                            break;
                        };
                        let execution_id = scheduler.execution_id().to_string();
                        let publisher = scheduler.publisher();
                        debug!(worker_id, execution_id = %execution_id, "Worker picked up execution");
                        if AssertUnwindSafe(scheduler.run()).catch_unwind().await.is_err()
                            && publish_aborted(&publisher, "panic while running")
                        {
                            error!(worker_id, execution_id = %execution_id, "Scheduler panicked, execution marked failed");
                        }
                    }
                    debug!(worker_id, "Worker stopped");
                })
            })
            .collect();

        info!(workers = config.workers, max_in_flight = config.max_in_flight, "Task registry started");

        Ok(Self {
            executions: RwLock::new(HashMap::new()),
            jobs: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
            runner: Arc::new(StepRunner::new(Arc::clone(&dispatcher))),
            dispatcher,
            recorder,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Validate a plan and queue it for execution
    ///
    /// Invalid plans are rejected before an execution id is assigned.
    pub async fn submit(&self, plan: Plan) -> Result<String> {
        plan.validate_shape()?;
        let graph = DependencyGraph::from_plan(&plan)?;
        if let Some(step) = plan.steps.iter().find(|s| !self.dispatcher.supports(&s.action)) {
            return Err(EngineError::invalid_plan(format!(
                "step '{}' uses unknown action '{}'",
                step.id, step.action
            )));
        }

        self.purge_expired().await;

        let jobs = self.jobs.lock().await;
        let Some(queue) = jobs.as_ref() else {
            return Err(EngineError::Shutdown);
        };

        let mut executions = self.executions.write().await;
        let mut execution_id = short_id("exec");
        while executions.contains_key(&execution_id) {
            execution_id = short_id("exec");
        }

        let plan_id = plan.id.clone();
        let steps = plan.len();
        let scheduler = PlanScheduler::new(
            execution_id.clone(),
            plan,
            graph,
            Arc::clone(&self.runner),
            Arc::clone(&self.recorder),
            SchedulerSettings::from(&self.config),
        );
        let entry = ExecutionEntry {
            snapshot: scheduler.subscribe(),
            publisher: scheduler.publisher(),
            cancel: scheduler.cancel_token(),
        };

        queue.send(scheduler).map_err(|_| EngineError::Shutdown)?;
        executions.insert(execution_id.clone(), entry);

        info!(execution_id = %execution_id, plan_id = %plan_id, steps, "Plan submitted");
        Ok(execution_id)
    }

    /// Latest published snapshot of an execution
    pub async fn status(&self, execution_id: &str) -> Result<PlanExecutionSnapshot> {
        let executions = self.executions.read().await;
        let entry = executions
            .get(execution_id)
            .ok_or_else(|| EngineError::NotFound(execution_id.to_string()))?;
        let snapshot = entry.snapshot.borrow().clone();
        Ok(snapshot)
    }

    /// Request cancellation
    ///
    /// Returns true if the execution was pending or running and is now
    /// cancelled; false if it was already terminal or is unknown.
    pub async fn cancel(&self, execution_id: &str) -> bool {
        let executions = self.executions.read().await;
        let Some(entry) = executions.get(execution_id) else {
            return false;
        };
        let cancelled = request_cancel(&entry.publisher, &entry.cancel);
        if cancelled {
            info!(execution_id, "Execution cancelled");
        }
        cancelled
    }

    /// Wait until the execution reaches a terminal state
    pub async fn wait(&self, execution_id: &str) -> Result<PlanExecutionSnapshot> {
        let mut rx = {
            let executions = self.executions.read().await;
            executions
                .get(execution_id)
                .ok_or_else(|| EngineError::NotFound(execution_id.to_string()))?
                .snapshot
                .clone()
        };
        let snapshot = rx
            .wait_for(|s| s.status.is_terminal())
            .await
            .map_err(|_| EngineError::Shutdown)?
            .clone();
        Ok(snapshot)
    }

    /// Every retained execution, oldest first
    pub async fn list(&self) -> Vec<ExecutionInfo> {
        let executions = self.executions.read().await;
        let mut infos: Vec<ExecutionInfo> = executions
            .values()
            .map(|entry| {
                let s = entry.snapshot.borrow();
                ExecutionInfo {
                    execution_id: s.execution_id.clone(),
                    plan_id: s.plan_id.clone(),
                    task: s.task.clone(),
                    status: s.status,
                    created_at: s.created_at,
                    updated_at: s.updated_at,
                }
            })
            .collect();
        infos.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        infos
    }

    /// Drop executions that have been terminal for longer than the retention
    pub async fn purge_expired(&self) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(self.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
        else {
            return 0;
        };

        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, entry| {
            let s = entry.snapshot.borrow();
            let finished = s.finished_at.unwrap_or(s.updated_at);
            !(s.status.is_terminal() && finished < cutoff)
        });
        let removed = before - executions.len();
        if removed > 0 {
            debug!(removed, "Purged expired executions");
        }
        removed
    }

    /// Drop a terminal execution now; running ones are kept
    pub async fn forget(&self, execution_id: &str) -> bool {
        let mut executions = self.executions.write().await;
        let terminal = executions
            .get(execution_id)
            .map(|entry| entry.snapshot.borrow().status.is_terminal())
            .unwrap_or(false);
        if terminal {
            executions.remove(execution_id);
        }
        terminal
    }

    /// Stop accepting plans, let queued and running executions finish and
    /// join the worker pool
    pub async fn shutdown(&self) {
        self.jobs.lock().await.take();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for result in join_all(workers).await {
            if let Err(e) = result {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
        info!("Task registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::builtin::builtin_registry;
    use crate::dag::Step;
    use crate::recorder::NoopRecorder;
    use std::time::Duration;

    fn registry(config: EngineConfig) -> TaskRegistry {
        TaskRegistry::new(config, Arc::new(builtin_registry()), Arc::new(NoopRecorder)).unwrap()
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let result = TaskRegistry::new(
            EngineConfig::builder().workers(0).build(),
            Arc::new(builtin_registry()),
            Arc::new(NoopRecorder),
        );
        assert!(matches!(result, Err(EngineError::Config(_))));
    }

    #[tokio::test]
    async fn test_unknown_execution() {
        let registry = registry(EngineConfig::default());
        assert!(matches!(
            registry.status("exec-missing").await,
            Err(EngineError::NotFound(_))
        ));
        assert!(!registry.cancel("exec-missing").await);
        assert!(!registry.forget("exec-missing").await);
    }

    #[tokio::test]
    async fn test_list_and_forget() {
        let registry = registry(EngineConfig::default());
        let plan = Plan::new("listed").with_step(Step::new("a", "passthrough"));
        let id = registry.submit(plan).await.unwrap();
        registry.wait(&id).await.unwrap();

        let infos = registry.list().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].execution_id, id);
        assert_eq!(infos[0].status, ExecutionStatus::Completed);

        assert!(registry.forget(&id).await);
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_purge_expired_respects_retention() {
        let registry = registry(EngineConfig::builder().retention(Duration::ZERO).build());
        let plan = Plan::new("short-lived").with_step(Step::new("a", "passthrough"));
        let id = registry.submit(plan).await.unwrap();
        registry.wait(&id).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert_eq!(registry.purge_expired().await, 1);
        assert!(registry.status(&id).await.is_err());
    }

    #[tokio::test]
    async fn test_submit_after_shutdown() {
        let registry = registry(EngineConfig::sequential());
        registry.shutdown().await;

        let plan = Plan::new("late").with_step(Step::new("a", "passthrough"));
        assert!(matches!(
            registry.submit(plan).await,
            Err(EngineError::Shutdown)
        ));
    }
}
