//! Lumen Store
//!
//! This crate provides the storage trait and implementations for tasks,
//! flow runs and flow step runs. The store is the single source of truth
//! for execution state and the only point of mutual exclusion between
//! workers: every state change is a conditional update against the row's
//! current status (and, for running tasks, the claiming worker).
//!
//! The [`Store`] trait defines operations for:
//! - Creating, claiming and finishing tasks
//! - Requeueing tasks whose lease expired
//! - Creating and advancing flow runs and their step runs
//! - Querying the audit trail
//!
//! Two implementations are provided: [`MemoryStore`] for tests and
//! single-process use, and [`SqliteStore`] for durable state.

mod memory;
mod sqlite;
mod transition;
mod types;

pub use memory::MemoryStore;
pub use sqlx::types::Json;
pub use sqlite::SqliteStore;
pub use transition::{Outcome, validate_new_step_run, validate_new_task};
pub use types::{
  DEFAULT_QUEUE, FailureKind, FlowRun, FlowRunFilter, FlowRunStatus, FlowStepRun, StepRunStatus, Task,
  TaskFilter, TaskStatus,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
  /// The requested record was not found.
  #[error("not found: {0}")]
  NotFound(String),

  /// A record was rejected at creation.
  #[error("invalid task: {0}")]
  InvalidTask(String),

  /// A step run would break its attempt chain.
  #[error("invalid step run: {0}")]
  InvalidStepRun(String),

  /// The operation is not valid from the record's current status.
  #[error("invalid transition for {id}: {message}")]
  InvalidTransition { id: String, message: String },

  /// Another writer already recorded a different outcome, or holds the claim.
  #[error("conflict on {id}: {message}")]
  Conflict { id: String, message: String },

  /// A payload could not be encoded or decoded.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// A database error occurred.
  #[error("database error: {0}")]
  Database(#[from] sqlx::Error),

  /// Applying migrations failed.
  #[error("migration error: {0}")]
  Migrate(#[from] sqlx::migrate::MigrateError),

  /// An in-memory lock was poisoned by a panicking writer.
  #[error("store lock poisoned")]
  Poisoned,
}

impl Error {
  pub fn is_conflict(&self) -> bool {
    matches!(self, Self::Conflict { .. })
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::NotFound(_))
  }
}

/// Storage trait for tasks, flow runs and flow step runs.
///
/// All implementations must guarantee that [`Store::claim_task`] never hands
/// the same task to two callers, and that terminal writes are idempotent for
/// the same outcome but rejected with [`Error::Conflict`] for a different one.
#[async_trait]
pub trait Store: Send + Sync {
  // --- Tasks ---

  /// Persist a new task in `pending` status.
  async fn create_task(&self, task: &Task) -> Result<(), Error>;

  /// Get a task by ID.
  async fn get_task(&self, task_id: &str) -> Result<Task, Error>;

  /// Atomically claim the best pending task on `queue_name`.
  ///
  /// Tasks are ordered by priority (descending) then creation order, and only
  /// tasks with `available_at <= now` are eligible. Returns `None` when
  /// nothing is claimable; losing a race is not an error.
  async fn claim_task(
    &self,
    queue_name: &str,
    worker_id: &str,
    now: DateTime<Utc>,
  ) -> Result<Option<Task>, Error>;

  /// Record a successful result. Valid only from `running` for the claiming worker.
  async fn complete_task(
    &self,
    task_id: &str,
    worker_id: &str,
    result: &serde_json::Value,
  ) -> Result<Task, Error>;

  /// Record a classified failure. Valid only from `running` for the claiming worker.
  async fn fail_task(
    &self,
    task_id: &str,
    worker_id: &str,
    error: &str,
    kind: FailureKind,
  ) -> Result<Task, Error>;

  /// Cancel a pending or running task.
  async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<Task, Error>;

  /// Return a running task to `pending` with `retry_count + 1`.
  ///
  /// Conditional on the task still being claimed by `worker_id`; rejected if
  /// the retry budget is spent.
  async fn requeue_task(
    &self,
    task_id: &str,
    worker_id: &str,
    error: &str,
    available_at: DateTime<Utc>,
  ) -> Result<Task, Error>;

  /// Update progress of a running task owned by `worker_id`.
  async fn update_progress(
    &self,
    task_id: &str,
    worker_id: &str,
    percentage: i32,
    current_step: Option<&str>,
  ) -> Result<(), Error>;

  /// List tasks matching a filter, oldest first.
  async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, Error>;

  /// List running tasks claimed before `started_before`.
  async fn list_expired_tasks(&self, started_before: DateTime<Utc>) -> Result<Vec<Task>, Error>;

  // --- Flow runs ---

  /// Create a new flow run.
  async fn create_flow_run(&self, run: &FlowRun) -> Result<(), Error>;

  /// Get a flow run by ID.
  async fn get_flow_run(&self, flow_run_id: &str) -> Result<FlowRun, Error>;

  /// Point a non-terminal run at the step attempt now in flight and mark it `running`.
  async fn advance_flow_run(
    &self,
    flow_run_id: &str,
    current_step: i32,
    current_task_id: &str,
  ) -> Result<(), Error>;

  /// Move a run to a terminal status.
  ///
  /// Returns `false` without writing if the run was already terminal.
  async fn finish_flow_run(
    &self,
    flow_run_id: &str,
    status: FlowRunStatus,
    error: Option<&str>,
  ) -> Result<bool, Error>;

  /// Flag a run for cancellation.
  async fn request_flow_run_cancel(&self, flow_run_id: &str) -> Result<FlowRun, Error>;

  /// List flow runs matching a filter, oldest first.
  async fn list_flow_runs(&self, filter: &FlowRunFilter) -> Result<Vec<FlowRun>, Error>;

  /// Delete a flow run and, with it, all of its step runs. Tasks are kept.
  async fn delete_flow_run(&self, flow_run_id: &str) -> Result<(), Error>;

  // --- Step runs ---

  /// Create a step run, enforcing the attempt chain.
  async fn create_step_run(&self, step_run: &FlowStepRun) -> Result<(), Error>;

  /// Get a step run by ID.
  async fn get_step_run(&self, step_run_id: &str) -> Result<FlowStepRun, Error>;

  /// Get the step run backed by `task_id`.
  async fn get_step_run_by_task(&self, task_id: &str) -> Result<FlowStepRun, Error>;

  /// Update a step run's status, output, error and timestamps.
  async fn update_step_run(&self, step_run: &FlowStepRun) -> Result<(), Error>;

  /// List step runs of a flow run by step index then attempt.
  async fn list_step_runs(&self, flow_run_id: &str) -> Result<Vec<FlowStepRun>, Error>;
}
