//! Engine Configuration
//!
//! Every field has a default, so an empty JSON object is a valid
//! configuration:
//!
//! ```json
//! {
//!   "max_concurrency": 8,
//!   "default_timeout_ms": null,
//!   "poll_interval_ms": 20,
//!   "background_workers": 4,
//!   "wire_format": "json"
//! }
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::wire::WireFormat;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum invocations running at once, across all requests.
    pub max_concurrency: usize,

    /// Deadline for callbacks whose binding sets none.
    pub default_timeout_ms: Option<u64>,

    /// How often background jobs are polled.
    pub poll_interval_ms: u64,

    /// Worker count of the built-in background executor.
    pub background_workers: usize,

    /// Encoding used by [`Engine::encode`](crate::Engine::encode).
    pub wire_format: WireFormat,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            default_timeout_ms: None,
            poll_interval_ms: 20,
            background_workers: 4,
            wire_format: WireFormat::Json,
        }
    }
}

impl EngineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "poll_interval_ms must be at least 1".to_string(),
            ));
        }
        if self.background_workers == 0 {
            return Err(ConfigError::Invalid(
                "background_workers must be at least 1".to_string(),
            ));
        }
        if self.default_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "default_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout_ms.map(Duration::from_millis)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}
