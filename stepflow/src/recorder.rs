//! Execution recording
//!
//! The scheduler reports step results and the final outcome of every plan
//! run to an [`ExecutionRecorder`]. Recording is best effort: a recorder
//! that fails is logged and the execution carries on.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::dag::Payload;
use crate::execution::{ExecutionStatus, PlanExecution};
use crate::runner::StepOutcome;

#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Recorder unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    StepCompleted,
    /// One failed attempt; the step may still be retried
    StepFailed,
    PlanFinished,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub plan_id: String,
    pub task: String,
    pub kind: RecordKind,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub step_id: Option<String>,
    /// Execution status when the record was made
    pub status: ExecutionStatus,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub attempt: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub payload: Option<Payload>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionRecord {
    fn base(execution: &PlanExecution, kind: RecordKind) -> Self {
        Self {
            execution_id: execution.id.clone(),
            plan_id: execution.plan.id.clone(),
            task: execution.plan.task.clone(),
            kind,
            step_id: None,
            status: execution.status,
            attempt: None,
            payload: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// Record for one finished step invocation
    pub fn step(execution: &PlanExecution, outcome: &StepOutcome) -> Self {
        let kind = if outcome.success {
            RecordKind::StepCompleted
        } else {
            RecordKind::StepFailed
        };
        Self {
            step_id: Some(outcome.step_id.clone()),
            attempt: Some(outcome.attempt),
            payload: outcome.success.then(|| outcome.payload.clone()),
            error: outcome.error.as_ref().map(|e| e.to_string()),
            ..Self::base(execution, kind)
        }
    }

    pub fn plan_finished(execution: &PlanExecution) -> Self {
        Self {
            error: execution.error.clone(),
            ..Self::base(execution, RecordKind::PlanFinished)
        }
    }
}

#[async_trait]
pub trait ExecutionRecorder: Send + Sync {
    async fn record(&self, record: &ExecutionRecord) -> Result<(), RecorderError>;
}

/// Send a record, logging instead of propagating failure or panics
pub(crate) async fn record_best_effort(recorder: &dyn ExecutionRecorder, record: ExecutionRecord) {
    let result = match AssertUnwindSafe(recorder.record(&record)).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(RecorderError::Unavailable("recorder panicked".to_string())),
    };
    if let Err(e) = result {
        warn!(
            execution_id = %record.execution_id,
            kind = ?record.kind,
            "Failed to record execution event: {}", e
        );
    }
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRecorder;

#[async_trait]
impl ExecutionRecorder for NoopRecorder {
    async fn record(&self, _record: &ExecutionRecord) -> Result<(), RecorderError> {
        Ok(())
    }
}

/// Writes records to the tracing log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogRecorder;

#[async_trait]
impl ExecutionRecorder for LogRecorder {
    async fn record(&self, record: &ExecutionRecord) -> Result<(), RecorderError> {
        match record.kind {
            RecordKind::PlanFinished => info!(
                execution_id = %record.execution_id,
                plan_id = %record.plan_id,
                status = %record.status,
                "Plan finished"
            ),
            RecordKind::StepCompleted | RecordKind::StepFailed => info!(
                execution_id = %record.execution_id,
                step_id = record.step_id.as_deref().unwrap_or(""),
                attempt = record.attempt.unwrap_or(0),
                kind = ?record.kind,
                error = record.error.as_deref().unwrap_or(""),
                "Step finished"
            ),
        }
        Ok(())
    }
}

/// Keeps records in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryRecorder {
    records: Arc<Mutex<Vec<ExecutionRecord>>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ExecutionRecord> {
        self.records.lock().await.clone()
    }

    pub async fn for_execution(&self, execution_id: &str) -> Vec<ExecutionRecord> {
        self.records
            .lock()
            .await
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

#[async_trait]
impl ExecutionRecorder for MemoryRecorder {
    async fn record(&self, record: &ExecutionRecord) -> Result<(), RecorderError> {
        self.records.lock().await.push(record.clone());
        Ok(())
    }
}

/// Appends one JSON object per line to a file
#[derive(Debug)]
pub struct JsonlRecorder {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlRecorder {
    /// Recorder appending to `path`; parent directories are created as needed
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, RecorderError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read back every record in a JSONL file, skipping blank lines
    pub fn read_all(path: &Path) -> Result<Vec<ExecutionRecord>, RecorderError> {
        let content = std::fs::read_to_string(path)?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(RecorderError::from))
            .collect()
    }
}

#[async_trait]
impl ExecutionRecorder for JsonlRecorder {
    async fn record(&self, record: &ExecutionRecord) -> Result<(), RecorderError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let _guard = self.lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}
