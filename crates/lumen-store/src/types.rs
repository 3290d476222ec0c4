use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;

/// Queue used when a task or step does not name one.
pub const DEFAULT_QUEUE: &str = "default";

/// Status of a dispatchable task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum TaskStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl TaskStatus {
  /// Whether the task has reached a final state.
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Running => "running",
      Self::Completed => "completed",
      Self::Failed => "failed",
      Self::Cancelled => "cancelled",
    }
  }
}

/// Status of a flow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FlowRunStatus {
  Pending,
  Running,
  Completed,
  /// Some steps succeeded before a later step exhausted its retries.
  Partial,
  Failed,
  Cancelled,
}

impl FlowRunStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      Self::Completed | Self::Partial | Self::Failed | Self::Cancelled
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      Self::Pending => "pending",
      Self::Running => "running",
      Self::Completed => "completed",
      Self::Partial => "partial",
      Self::Failed => "failed",
      Self::Cancelled => "cancelled",
    }
  }
}

/// Status of one attempt of one step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum StepRunStatus {
  Pending,
  Running,
  Completed,
  Failed,
  Cancelled,
}

impl StepRunStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
  }
}

/// How a failed task's error was classified by its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum FailureKind {
  Transient,
  Permanent,
}

impl FailureKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Transient => "transient",
      Self::Permanent => "permanent",
    }
  }
}

/// A unit of dispatchable work as stored in the database.
///
/// `inputs` is fixed at creation. `result` is written once, on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Task {
  pub task_id: String,
  pub task_name: String,
  pub status: TaskStatus,
  pub queue_name: String,
  /// Handler id used to execute a standalone task.
  pub task_type: String,
  pub inputs: Json<serde_json::Value>,
  pub result: Option<Json<serde_json::Value>>,
  pub error_message: Option<String>,
  pub failure_kind: Option<FailureKind>,
  pub created_at: DateTime<Utc>,
  /// Earliest time the task may be claimed.
  pub available_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
  pub progress_percentage: i32,
  pub current_step: Option<String>,
  pub retry_count: i32,
  pub max_retries: i32,
  /// Higher values are claimed sooner.
  pub priority: i32,
  pub worker_id: Option<String>,
  pub flow_run_id: Option<String>,
  pub owner_id: Option<String>,
}

impl Task {
  /// Build a new pending task on the default queue.
  pub fn new(
    task_name: impl Into<String>,
    task_type: impl Into<String>,
    inputs: serde_json::Value,
  ) -> Self {
    let now = Utc::now();
    Self {
      task_id: uuid::Uuid::new_v4().to_string(),
      task_name: task_name.into(),
      status: TaskStatus::Pending,
      queue_name: DEFAULT_QUEUE.to_string(),
      task_type: task_type.into(),
      inputs: Json(inputs),
      result: None,
      error_message: None,
      failure_kind: None,
      created_at: now,
      available_at: now,
      started_at: None,
      completed_at: None,
      progress_percentage: 0,
      current_step: None,
      retry_count: 0,
      max_retries: 0,
      priority: 0,
      worker_id: None,
      flow_run_id: None,
      owner_id: None,
    }
  }

  /// Build a new task from any serializable input payload.
  pub fn from_inputs<T: Serialize>(
    task_name: impl Into<String>,
    task_type: impl Into<String>,
    inputs: &T,
  ) -> Result<Self, crate::Error> {
    let inputs = serde_json::to_value(inputs)
      .map_err(|e| crate::Error::InvalidTask(format!("inputs are not serializable: {}", e)))?;
    Ok(Self::new(task_name, task_type, inputs))
  }

  pub fn with_queue(mut self, queue_name: impl Into<String>) -> Self {
    self.queue_name = queue_name.into();
    self
  }

  pub fn with_priority(mut self, priority: i32) -> Self {
    self.priority = priority;
    self
  }

  pub fn with_max_retries(mut self, max_retries: i32) -> Self {
    self.max_retries = max_retries;
    self
  }

  pub fn with_retry_count(mut self, retry_count: i32) -> Self {
    self.retry_count = retry_count;
    self
  }

  pub fn with_owner(mut self, owner_id: impl Into<String>) -> Self {
    self.owner_id = Some(owner_id.into());
    self
  }

  pub fn with_flow_run(mut self, flow_run_id: impl Into<String>) -> Self {
    self.flow_run_id = Some(flow_run_id.into());
    self
  }

  pub fn available_at(mut self, at: DateTime<Utc>) -> Self {
    self.available_at = at;
    self
  }

  /// Whether another attempt fits in the retry budget.
  pub fn has_retry_budget(&self) -> bool {
    self.retry_count < self.max_retries
  }
}

/// One invocation of a flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FlowRun {
  pub flow_run_id: String,
  pub flow_name: String,
  pub inputs: Json<serde_json::Value>,
  /// Index of the step currently in flight.
  pub current_step: i32,
  pub status: FlowRunStatus,
  /// The task backing the step attempt currently in flight.
  pub current_task_id: Option<String>,
  pub owner_id: Option<String>,
  /// Last error, kept for `partial` and `failed` runs.
  pub error: Option<String>,
  pub cancel_requested: bool,
  pub created_at: DateTime<Utc>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl FlowRun {
  pub fn new(flow_name: impl Into<String>, inputs: serde_json::Value) -> Self {
    Self {
      flow_run_id: uuid::Uuid::new_v4().to_string(),
      flow_name: flow_name.into(),
      inputs: Json(inputs),
      current_step: 0,
      status: FlowRunStatus::Pending,
      current_task_id: None,
      owner_id: None,
      error: None,
      cancel_requested: false,
      created_at: Utc::now(),
      completed_at: None,
    }
  }

  pub fn with_owner(mut self, owner_id: Option<String>) -> Self {
    self.owner_id = owner_id;
    self
  }
}

/// One attempt of one step within a flow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct FlowStepRun {
  pub step_run_id: String,
  pub flow_run_id: String,
  pub step_index: i32,
  pub step_name: String,
  pub retry_attempt: i32,
  /// The failed attempt this one replaces.
  pub retry_of_step_run_id: Option<String>,
  pub task_id: String,
  pub status: StepRunStatus,
  pub inputs: Json<serde_json::Value>,
  pub output: Option<Json<serde_json::Value>>,
  pub error: Option<String>,
  pub created_at: DateTime<Utc>,
  pub started_at: Option<DateTime<Utc>>,
  pub completed_at: Option<DateTime<Utc>>,
}

impl FlowStepRun {
  /// First attempt of a step.
  pub fn first_attempt(
    flow_run_id: impl Into<String>,
    step_index: i32,
    step_name: impl Into<String>,
    task_id: impl Into<String>,
    inputs: serde_json::Value,
  ) -> Self {
    Self {
      step_run_id: uuid::Uuid::new_v4().to_string(),
      flow_run_id: flow_run_id.into(),
      step_index,
      step_name: step_name.into(),
      retry_attempt: 0,
      retry_of_step_run_id: None,
      task_id: task_id.into(),
      status: StepRunStatus::Pending,
      inputs: Json(inputs),
      output: None,
      error: None,
      created_at: Utc::now(),
      started_at: None,
      completed_at: None,
    }
  }

  /// The attempt that replaces `failed`, reusing its input snapshot.
  pub fn retry_of(failed: &FlowStepRun, task_id: impl Into<String>) -> Self {
    Self {
      step_run_id: uuid::Uuid::new_v4().to_string(),
      flow_run_id: failed.flow_run_id.clone(),
      step_index: failed.step_index,
      step_name: failed.step_name.clone(),
      retry_attempt: failed.retry_attempt + 1,
      retry_of_step_run_id: Some(failed.step_run_id.clone()),
      task_id: task_id.into(),
      status: StepRunStatus::Pending,
      inputs: failed.inputs.clone(),
      output: None,
      error: None,
      created_at: Utc::now(),
      started_at: None,
      completed_at: None,
    }
  }
}

/// Filter for audit queries over tasks. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
  pub status: Option<TaskStatus>,
  pub queue_name: Option<String>,
  pub task_type: Option<String>,
  pub owner_id: Option<String>,
  pub flow_run_id: Option<String>,
}

impl TaskFilter {
  pub fn matches(&self, task: &Task) -> bool {
    self.status.is_none_or(|s| s == task.status)
      && self
        .queue_name
        .as_deref()
        .is_none_or(|q| q == task.queue_name)
      && self
        .task_type
        .as_deref()
        .is_none_or(|t| t == task.task_type)
      && self
        .owner_id
        .as_deref()
        .is_none_or(|o| task.owner_id.as_deref() == Some(o))
      && self
        .flow_run_id
        .as_deref()
        .is_none_or(|f| task.flow_run_id.as_deref() == Some(f))
  }
}

/// Filter for flow run queries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowRunFilter {
  pub status: Option<FlowRunStatus>,
  pub owner_id: Option<String>,
  pub flow_name: Option<String>,
}

impl FlowRunFilter {
  pub fn matches(&self, run: &FlowRun) -> bool {
    self.status.is_none_or(|s| s == run.status)
      && self
        .owner_id
        .as_deref()
        .is_none_or(|o| run.owner_id.as_deref() == Some(o))
      && self
        .flow_name
        .as_deref()
        .is_none_or(|f| f == run.flow_name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_task_builder_defaults() {
    let task = Task::new("outline", "llm", json!({"topic": "fractions"}));
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.queue_name, DEFAULT_QUEUE);
    assert_eq!(task.retry_count, 0);
    assert!(task.completed_at.is_none());
    assert!(!task.has_retry_budget());
  }

  #[test]
  fn test_payload_round_trip() {
    let inputs = json!({"topic": "fractions", "levels": [1, 2, 3], "nested": {"a": null}});
    let task = Task::new("outline", "llm", inputs.clone());
    let encoded = serde_json::to_string(&task).unwrap();
    let decoded: Task = serde_json::from_str(&encoded).unwrap();
    assert_eq!(decoded.inputs.0, inputs);
    assert_eq!(serde_json::to_vec(&decoded.inputs.0).unwrap(), serde_json::to_vec(&inputs).unwrap());
  }

  #[test]
  fn test_retry_of_chains_attempts() {
    let first = FlowStepRun::first_attempt("run", 1, "lessons", "t1", json!({"x": 1}));
    let second = FlowStepRun::retry_of(&first, "t2");
    assert_eq!(second.retry_attempt, 1);
    assert_eq!(second.retry_of_step_run_id.as_deref(), Some(first.step_run_id.as_str()));
    assert_eq!(second.inputs, first.inputs);
    assert_eq!(second.step_index, 1);
  }

  #[test]
  fn test_task_filter() {
    let task = Task::new("outline", "llm", json!({}))
      .with_queue("background")
      .with_owner("unit-1");
    let filter = TaskFilter {
      queue_name: Some("background".to_string()),
      owner_id: Some("unit-1".to_string()),
      ..Default::default()
    };
    assert!(filter.matches(&task));

    let filter = TaskFilter {
      status: Some(TaskStatus::Running),
      ..Default::default()
    };
    assert!(!filter.matches(&task));
  }
}
