pub mod action;
pub mod config;
pub mod dag;
pub mod error;
pub mod execution;
pub mod recorder;
pub mod registry;
pub mod retry;
pub mod runner;
pub mod scheduler;

pub use action::{
    ActionDispatcher, ActionError, ActionHandler, ActionInput, ActionKind, ActionRegistry,
    CachingDispatcher, FnHandler,
};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use dag::{DependencyGraph, Params, Payload, Plan, RetryPolicy, Step};
pub use error::{EngineError, Result};
pub use execution::{
    ExecutionStatus, ExecutionSummary, FailureCause, PlanExecution, PlanExecutionSnapshot,
    StepFailure, StepReport, StepState,
};
pub use recorder::{
    ExecutionRecord, ExecutionRecorder, JsonlRecorder, LogRecorder, MemoryRecorder, NoopRecorder,
    RecordKind, RecorderError,
};
pub use registry::{ExecutionInfo, TaskRegistry};
pub use retry::RetryController;
pub use runner::{StepError, StepErrorKind, StepOutcome, StepRunner};
pub use scheduler::{PlanScheduler, SchedulerSettings};
