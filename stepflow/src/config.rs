//! Engine configuration
//!
//! Durations are written in seconds in config files:
//!
//! ```yaml
//! workers: 4
//! max_in_flight: 8
//! default_step_timeout: 300
//! max_backoff: 60        # or null for no cap
//! retention: 3600
//! record_step_events: true
//! cache_responses: false
//! cache_ttl: 600
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Size of the registry's worker pool (concurrent executions)
    pub workers: usize,
    /// Steps dispatched per round at most
    pub max_in_flight: usize,
    /// Used when a step declares no timeout
    #[serde(with = "secs")]
    pub default_step_timeout: Duration,
    /// Cap applied to retry backoff delays
    #[serde(with = "opt_secs")]
    pub max_backoff: Option<Duration>,
    /// How long terminal executions stay queryable
    #[serde(with = "secs")]
    pub retention: Duration,
    /// Emit a record for every step attempt, not only the final outcome
    pub record_step_events: bool,
    /// Serve cacheable actions from a response cache
    pub cache_responses: bool,
    #[serde(with = "secs")]
    pub cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_in_flight: 8,
            default_step_timeout: Duration::from_secs(300),
            max_backoff: Some(Duration::from_secs(60)),
            retention: Duration::from_secs(3600),
            record_step_events: true,
            cache_responses: false,
            cache_ttl: Duration::from_secs(600),
        }
    }
}

impl EngineConfig {
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }

    /// One execution at a time, one step at a time
    pub fn sequential() -> Self {
        Self {
            workers: 1,
            max_in_flight: 1,
            ..Default::default()
        }
    }

    /// Many concurrent executions with wide rounds
    pub fn wide() -> Self {
        Self {
            workers: 16,
            max_in_flight: 64,
            ..Default::default()
        }
    }

    /// Load from a YAML (`.yaml`/`.yml`) or JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&content)?,
            _ => serde_yaml::from_str(&content)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// `<config dir>/stepflow/config.yaml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("stepflow").join("config.yaml"))
    }

    /// `explicit` if given, else the default path if it exists, else defaults
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }
        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be greater than 0".to_string()));
        }
        if self.max_in_flight == 0 {
            return Err(EngineError::Config(
                "max_in_flight must be greater than 0".to_string(),
            ));
        }
        if self.default_step_timeout.is_zero() {
            return Err(EngineError::Config(
                "default_step_timeout must be greater than 0".to_string(),
            ));
        }
        if self.cache_responses && self.cache_ttl.is_zero() {
            return Err(EngineError::Config(
                "cache_ttl must be greater than 0 when caching is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn max_in_flight(mut self, max: usize) -> Self {
        self.config.max_in_flight = max;
        self
    }

    pub fn default_step_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_step_timeout = timeout;
        self
    }

    pub fn max_backoff(mut self, cap: Option<Duration>) -> Self {
        self.config.max_backoff = cap;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.config.retention = retention;
        self
    }

    pub fn record_step_events(mut self, enable: bool) -> Self {
        self.config.record_step_events = enable;
        self
    }

    pub fn cache_responses(mut self, enable: bool) -> Self {
        self.config.cache_responses = enable;
        self
    }

    pub fn cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.cache_ttl = ttl;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

mod opt_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        match Option::<f64>::deserialize(deserializer)? {
            Some(secs) => Duration::try_from_secs_f64(secs)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
