//! Retry decisions and backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use lumen_flow::StepFailure;
use lumen_store::{FailureKind, Task};

use crate::config::RetryConfig;

/// Decides whether a failed task gets another attempt, and when.
///
/// Backoff is exponential and deterministic: `min(base * multiplier^attempt, max)`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
  pub base_delay: Duration,
  pub max_delay: Duration,
  pub multiplier: f64,
  pub default_max_retries: u32,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::from_config(&RetryConfig::default())
  }
}

impl RetryPolicy {
  pub fn from_config(config: &RetryConfig) -> Self {
    Self {
      base_delay: Duration::from_millis(config.base_delay_ms),
      max_delay: Duration::from_millis(config.max_delay_ms),
      multiplier: config.multiplier.max(1.0),
      default_max_retries: config.default_max_retries,
    }
  }

  /// Retries immediately; used by tests that should not wait.
  pub fn immediate(default_max_retries: u32) -> Self {
    Self {
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
      multiplier: 1.0,
      default_max_retries,
    }
  }

  /// Delay before the attempt that follows `attempt` failures.
  pub fn backoff(&self, attempt: u32) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let delay = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
    let capped = delay.min(self.max_delay.as_secs_f64());
    if capped.is_finite() && capped >= 0.0 {
      Duration::from_secs_f64(capped)
    } else {
      self.max_delay
    }
  }

  /// When the next attempt after `attempt` failures becomes claimable.
  pub fn next_available_at(&self, now: DateTime<Utc>, attempt: u32) -> DateTime<Utc> {
    let delay = chrono::Duration::from_std(self.backoff(attempt)).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(delay).unwrap_or(now)
  }

  /// Whether a failure of `kind` on `task` is retried.
  ///
  /// Permanent failures are never retried, whatever budget remains.
  pub fn should_retry(&self, task: &Task, kind: FailureKind) -> bool {
    kind == FailureKind::Transient && task.has_retry_budget()
  }

  /// Same decision for a failed task, using the classification stored on it.
  pub fn should_retry_failed(&self, task: &Task) -> bool {
    task
      .failure_kind
      .is_some_and(|kind| self.should_retry(task, kind))
  }
}

/// Storage classification of a handler failure. Cancellation has none.
pub fn failure_kind(failure: &StepFailure) -> Option<FailureKind> {
  match failure {
    StepFailure::Transient(_) => Some(FailureKind::Transient),
    StepFailure::Permanent(_) => Some(FailureKind::Permanent),
    StepFailure::Cancelled => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn policy() -> RetryPolicy {
    RetryPolicy::from_config(&RetryConfig {
      base_delay_ms: 100,
      max_delay_ms: 1_000,
      multiplier: 2.0,
      default_max_retries: 3,
    })
  }

  #[test]
  fn test_backoff_is_exponential_and_capped() {
    let policy = policy();
    assert_eq!(policy.backoff(0), Duration::from_millis(100));
    assert_eq!(policy.backoff(1), Duration::from_millis(200));
    assert_eq!(policy.backoff(3), Duration::from_millis(800));
    assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
    assert_eq!(policy.backoff(u32::MAX), Duration::from_millis(1_000));
  }

  #[test]
  fn test_backoff_never_decreases() {
    let policy = policy();
    let delays: Vec<Duration> = (0..40).map(|a| policy.backoff(a)).collect();
    assert!(delays.windows(2).all(|w| w[0] <= w[1]));
  }

  #[test]
  fn test_transient_retried_within_budget() {
    let policy = policy();
    let task = Task::new("outline", "llm", json!({})).with_max_retries(2);
    assert!(policy.should_retry(&task, FailureKind::Transient));

    let spent = task.clone().with_retry_count(2);
    assert!(!policy.should_retry(&spent, FailureKind::Transient));
  }

  #[test]
  fn test_permanent_never_retried() {
    let policy = policy();
    let task = Task::new("outline", "llm", json!({})).with_max_retries(5);
    assert!(!policy.should_retry(&task, FailureKind::Permanent));
  }

  #[test]
  fn test_stored_classification() {
    let policy = policy();
    let mut task = Task::new("outline", "llm", json!({})).with_max_retries(1);
    assert!(!policy.should_retry_failed(&task));
    task.failure_kind = Some(FailureKind::Transient);
    assert!(policy.should_retry_failed(&task));
  }

  #[test]
  fn test_failure_kind_mapping() {
    assert_eq!(
      failure_kind(&StepFailure::transient("timeout")),
      Some(FailureKind::Transient)
    );
    assert_eq!(
      failure_kind(&StepFailure::permanent("bad schema")),
      Some(FailureKind::Permanent)
    );
    assert_eq!(failure_kind(&StepFailure::Cancelled), None);
  }
}
