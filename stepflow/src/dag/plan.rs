use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::step::{Params, Step};
use crate::error::{EngineError, Result};

/// A named set of steps with declared dependencies
///
/// Step order is used only for stable output ordering and tie-breaking,
/// never as execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default = "new_plan_id")]
    pub id: String,
    /// Human-readable label of what the plan accomplishes
    #[serde(default)]
    pub task: String,
    pub steps: Vec<Step>,
    /// Context/requirements metadata, handed to every action
    #[serde(default)]
    pub context: Params,
}

fn new_plan_id() -> String {
    short_id("plan")
}

/// `prefix-xxxxxxxx` identifier from a fresh v4 UUID
pub(crate) fn short_id(prefix: &str) -> String {
    let uuid = Uuid::new_v4().simple().to_string();
    format!("{}-{}", prefix, &uuid[..8])
}

impl Plan {
    pub fn new(task: impl Into<String>) -> Self {
        Self {
            id: new_plan_id(),
            task: task.into(),
            steps: vec![],
            context: Params::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_step(mut self, step: Step) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_steps(mut self, steps: impl IntoIterator<Item = Step>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Per-step checks that need no graph: ids and retry policies
    pub fn validate_shape(&self) -> Result<()> {
        let mut seen = HashSet::new();

        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(EngineError::invalid_plan("step with empty id"));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(EngineError::invalid_plan(format!(
                    "duplicate step id '{}'",
                    step.id
                )));
            }
            if step.action.trim().is_empty() {
                return Err(EngineError::invalid_plan(format!(
                    "step '{}' has no action",
                    step.id
                )));
            }
            step.retry.check().map_err(|reason| {
                EngineError::invalid_plan(format!("step '{}': {}", step.id, reason))
            })?;
        }

        Ok(())
    }

    /// Load a plan from a YAML or JSON file (chosen by extension)
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;

        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content),
            _ => Self::from_yaml_str(&content),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}
