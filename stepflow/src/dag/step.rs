use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque key/value payload handed to an action
pub type Params = serde_json::Map<String, Value>;

/// Opaque key/value result produced by an action
pub type Payload = serde_json::Map<String, Value>;

/// Per-step retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total invocations allowed, including the first (>= 1)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for each later attempt
    #[serde(default = "default_base_delay")]
    pub base_delay_seconds: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_seconds: default_base_delay(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_seconds: f64) -> Self {
        Self {
            max_attempts,
            base_delay_seconds,
        }
    }

    /// Single attempt, no retries
    pub fn none() -> Self {
        Self::new(1, 0.0)
    }

    pub fn base_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.base_delay_seconds).unwrap_or(Duration::ZERO)
    }

    pub(crate) fn check(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be at least 1".to_string());
        }
        if !self.base_delay_seconds.is_finite() || self.base_delay_seconds < 0.0 {
            return Err(format!(
                "base_delay_seconds must be a non-negative number, got {}",
                self.base_delay_seconds
            ));
        }
        Ok(())
    }
}

/// One unit of work within a plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the owning plan
    pub id: String,
    /// Name of a registered action
    pub action: String,
    #[serde(default)]
    pub params: Params,
    /// Ids of steps that must complete before this one runs
    #[serde(default, alias = "dependencies")]
    pub depends_on: BTreeSet<String>,
    /// Hint in seconds, used only to order steps within a round
    #[serde(default)]
    pub estimated_duration: f64,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Overrides the engine's default step timeout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<f64>,
}

impl Step {
    pub fn new(id: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            params: Params::new(),
            depends_on: BTreeSet::new(),
            estimated_duration: 0.0,
            retry: RetryPolicy::default(),
            timeout_seconds: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = params;
        self
    }

    /// Add a dependency: this step runs only after `step_id` completes
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.depends_on.insert(step_id.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_estimated_duration(mut self, seconds: f64) -> Self {
        self.estimated_duration = seconds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_seconds = Some(timeout.as_secs_f64());
        self
    }

    /// Declared timeout, if any and valid
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds
            .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
            .filter(|d| !d.is_zero())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builder() {
        let step = Step::new("fetch", "passthrough")
            .with_param("url", "https://example.com")
            .depends_on("auth")
            .depends_on("auth")
            .with_estimated_duration(2.5)
            .with_timeout(Duration::from_secs(10));

        assert_eq!(step.id, "fetch");
        assert_eq!(step.params["url"], "https://example.com");
        assert_eq!(step.depends_on.len(), 1);
        assert_eq!(step.timeout(), Some(Duration::from_secs(10)));
        assert_eq!(step.retry, RetryPolicy::default());
    }

    #[test]
    fn test_step_deserialize_defaults() {
        let step: Step = serde_json::from_str(r#"{"id": "a", "action": "passthrough"}"#).unwrap();

        assert!(step.params.is_empty());
        assert!(step.depends_on.is_empty());
        assert_eq!(step.retry.max_attempts, 3);
        assert_eq!(step.retry.base_delay_seconds, 1.0);
        assert_eq!(step.timeout(), None);
    }

    #[test]
    fn test_dependencies_alias() {
        let step: Step = serde_json::from_str(
            r#"{"id": "b", "action": "passthrough", "dependencies": ["a"]}"#,
        )
        .unwrap();
        assert!(step.depends_on.contains("a"));
    }

    #[test]
    fn test_retry_policy_check() {
        assert!(RetryPolicy::default().check().is_ok());
        assert!(RetryPolicy::new(0, 1.0).check().is_err());
        assert!(RetryPolicy::new(1, -0.5).check().is_err());
        assert!(RetryPolicy::new(1, f64::NAN).check().is_err());
        assert_eq!(RetryPolicy::new(2, 0.25).base_delay(), Duration::from_millis(250));
    }
}
