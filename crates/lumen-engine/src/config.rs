//! Engine configuration.
//!
//! Loaded from a JSON document; every field is optional and falls back to
//! its default.
//!
//! ```json
//! {
//!   "queues": ["default", "background"],
//!   "concurrency": 4,
//!   "lease_ms": 300000,
//!   "retry": { "base_delay_ms": 1000, "max_delay_ms": 60000 }
//! }
//! ```

use std::path::Path;
use std::time::Duration;

use lumen_store::DEFAULT_QUEUE;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
  /// Queues this process claims from, in preference order.
  pub queues: Vec<String>,
  /// Number of concurrent executors in the worker pool.
  pub concurrency: usize,
  /// How long an idle executor waits for a wake-up before polling the store.
  pub poll_interval_ms: u64,
  /// How long a claimed task may run before the reaper treats it as abandoned.
  pub lease_ms: u64,
  pub reap_interval_ms: u64,
  pub retry: RetryConfig,
}

impl Default for EngineConfig {
  fn default() -> Self {
    Self {
      queues: vec![DEFAULT_QUEUE.to_string()],
      concurrency: 4,
      poll_interval_ms: 1_000,
      lease_ms: 5 * 60 * 1_000,
      reap_interval_ms: 30_000,
      retry: RetryConfig::default(),
    }
  }
}

impl EngineConfig {
  /// Parse a config document.
  pub fn from_json(content: &str) -> Result<Self, EngineError> {
    Self::parse(content, "<inline>")
  }

  /// Load from `path`, or return defaults if the file does not exist.
  pub fn load_or_default(path: &Path) -> Result<Self, EngineError> {
    if !path.exists() {
      return Ok(Self::default());
    }
    let config_error = |message: String| EngineError::Config {
      path: path.display().to_string(),
      message,
    };
    let content = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
    Self::parse(&content, &path.display().to_string())
  }

  fn parse(content: &str, path: &str) -> Result<Self, EngineError> {
    let config: Self = serde_json::from_str(content).map_err(|e| EngineError::Config {
      path: path.to_string(),
      message: e.to_string(),
    })?;
    config.validate().map_err(|message| EngineError::Config {
      path: path.to_string(),
      message,
    })?;
    Ok(config)
  }

  /// Timers are driven by these values and cannot tick at a zero period.
  fn validate(&self) -> Result<(), String> {
    for (field, value) in [
      ("poll_interval_ms", self.poll_interval_ms),
      ("reap_interval_ms", self.reap_interval_ms),
      ("lease_ms", self.lease_ms),
    ] {
      if value == 0 {
        return Err(format!("{} must be greater than zero", field));
      }
    }
    Ok(())
  }

  pub fn poll_interval(&self) -> Duration {
    Duration::from_millis(self.poll_interval_ms.max(1))
  }

  pub fn lease(&self) -> Duration {
    Duration::from_millis(self.lease_ms)
  }

  pub fn reap_interval(&self) -> Duration {
    Duration::from_millis(self.reap_interval_ms.max(1))
  }
}

/// Backoff and budget settings for retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  pub base_delay_ms: u64,
  pub max_delay_ms: u64,
  pub multiplier: f64,
  /// Budget for steps and tasks that do not set `max_retries`.
  pub default_max_retries: u32,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self {
      base_delay_ms: 1_000,
      max_delay_ms: 60_000,
      multiplier: 2.0,
      default_max_retries: 3,
    }
  }
}
