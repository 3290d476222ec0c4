//! Status transition rules shared by every store implementation.
//!
//! Each check inspects the current row and decides whether the write should
//! be applied, is a repeat of an outcome already recorded, or must be refused.

use crate::types::{FailureKind, FlowStepRun, StepRunStatus, Task, TaskStatus};
use crate::Error;

/// Decision for a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// Perform the write.
  Apply,
  /// The same outcome is already recorded; the write is a no-op.
  AlreadyRecorded,
}

/// Reject tasks that cannot be stored as new pending work.
pub fn validate_new_task(task: &Task) -> Result<(), Error> {
  let invalid = |message: String| Err(Error::InvalidTask(format!("{}: {}", task.task_id, message)));

  if task.status != TaskStatus::Pending {
    return invalid(format!("new tasks must be pending, got {}", task.status.as_str()));
  }
  if task.max_retries < 0 {
    return invalid(format!("max_retries must be >= 0, got {}", task.max_retries));
  }
  if task.retry_count < 0 || task.retry_count > task.max_retries {
    return invalid(format!(
      "retry_count {} outside 0..={}",
      task.retry_count, task.max_retries
    ));
  }
  if task.task_name.is_empty() || task.queue_name.is_empty() || task.task_type.is_empty() {
    return invalid("task_name, queue_name and task_type are required".to_string());
  }
  if !(0..=100).contains(&task.progress_percentage) {
    return invalid(format!("progress {} outside 0..=100", task.progress_percentage));
  }
  if task.result.is_some() || task.completed_at.is_some() || task.started_at.is_some() {
    return invalid("new tasks cannot carry a result or timestamps".to_string());
  }
  if let Err(e) = serde_json::to_string(&task.inputs.0) {
    return invalid(format!("inputs are not serializable: {}", e));
  }
  Ok(())
}

fn conflict(task: &Task, message: impl Into<String>) -> Error {
  Error::Conflict {
    id: task.task_id.clone(),
    message: message.into(),
  }
}

fn invalid_transition(task: &Task, message: impl Into<String>) -> Error {
  Error::InvalidTransition {
    id: task.task_id.clone(),
    message: message.into(),
  }
}

fn check_owner(task: &Task, worker_id: &str) -> Result<(), Error> {
  match task.worker_id.as_deref() {
    Some(owner) if owner == worker_id => Ok(()),
    Some(owner) => Err(conflict(
      task,
      format!("claimed by worker {}, not {}", owner, worker_id),
    )),
    None => Err(conflict(task, "running task has no owner")),
  }
}

pub(crate) fn check_complete(
  task: &Task,
  worker_id: &str,
  result: &serde_json::Value,
) -> Result<Outcome, Error> {
  match task.status {
    TaskStatus::Running => check_owner(task, worker_id).map(|_| Outcome::Apply),
    TaskStatus::Completed if task.result.as_ref().map(|r| &r.0) == Some(result) => {
      Ok(Outcome::AlreadyRecorded)
    }
    TaskStatus::Completed => Err(conflict(task, "already completed with a different result")),
    TaskStatus::Failed | TaskStatus::Cancelled => Err(conflict(
      task,
      format!("cannot complete, already {}", task.status.as_str()),
    )),
    TaskStatus::Pending => Err(invalid_transition(task, "cannot complete a pending task")),
  }
}

pub(crate) fn check_fail(
  task: &Task,
  worker_id: &str,
  error: &str,
  kind: FailureKind,
) -> Result<Outcome, Error> {
  match task.status {
    TaskStatus::Running => check_owner(task, worker_id).map(|_| Outcome::Apply),
    TaskStatus::Failed
      if task.error_message.as_deref() == Some(error) && task.failure_kind == Some(kind) =>
    {
      Ok(Outcome::AlreadyRecorded)
    }
    TaskStatus::Failed => Err(conflict(task, "already failed with a different error")),
    TaskStatus::Completed | TaskStatus::Cancelled => Err(conflict(
      task,
      format!("cannot fail, already {}", task.status.as_str()),
    )),
    TaskStatus::Pending => Err(invalid_transition(task, "cannot fail a pending task")),
  }
}

pub(crate) fn check_cancel(task: &Task) -> Result<Outcome, Error> {
  match task.status {
    TaskStatus::Pending | TaskStatus::Running => Ok(Outcome::Apply),
    TaskStatus::Cancelled => Ok(Outcome::AlreadyRecorded),
    TaskStatus::Completed | TaskStatus::Failed => Err(conflict(
      task,
      format!("cannot cancel, already {}", task.status.as_str()),
    )),
  }
}

pub(crate) fn check_requeue(task: &Task, worker_id: &str) -> Result<Outcome, Error> {
  match task.status {
    TaskStatus::Running => {
      check_owner(task, worker_id)?;
      if !task.has_retry_budget() {
        return Err(invalid_transition(
          task,
          format!("retry budget spent ({}/{})", task.retry_count, task.max_retries),
        ));
      }
      Ok(Outcome::Apply)
    }
    _ => Err(conflict(
      task,
      format!("cannot requeue, task is {}", task.status.as_str()),
    )),
  }
}

pub(crate) fn check_progress(task: &Task, worker_id: &str, percentage: i32) -> Result<(), Error> {
  if !(0..=100).contains(&percentage) {
    return Err(Error::InvalidTask(format!(
      "{}: progress {} outside 0..=100",
      task.task_id, percentage
    )));
  }
  if task.status != TaskStatus::Running {
    return Err(invalid_transition(
      task,
      format!("cannot report progress, task is {}", task.status.as_str()),
    ));
  }
  check_owner(task, worker_id)
}

/// Check that `new` extends the attempt chain formed by `siblings`.
///
/// `siblings` are the existing step runs with the same flow run and step index.
pub fn validate_new_step_run(new: &FlowStepRun, siblings: &[FlowStepRun]) -> Result<(), Error> {
  let invalid = |message: String| {
    Err(Error::InvalidStepRun(format!(
      "{} (step {} attempt {}): {}",
      new.flow_run_id, new.step_index, new.retry_attempt, message
    )))
  };

  let Some(prev_id) = new.retry_of_step_run_id.as_deref() else {
    if new.retry_attempt != 0 {
      return invalid("attempts without retry_of must be attempt 0".to_string());
    }
    if !siblings.is_empty() {
      return invalid("step already has an attempt 0".to_string());
    }
    return Ok(());
  };

  let Some(prev) = siblings.iter().find(|s| s.step_run_id == prev_id) else {
    return invalid(format!(
      "retry_of {} is not an attempt of the same run and step",
      prev_id
    ));
  };
  if prev.status != StepRunStatus::Failed {
    return invalid(format!("retry_of {} has not failed", prev_id));
  }
  if new.retry_attempt != prev.retry_attempt + 1 {
    return invalid(format!(
      "attempt must follow {} directly",
      prev.retry_attempt
    ));
  }
  if siblings
    .iter()
    .any(|s| s.retry_of_step_run_id.as_deref() == Some(prev_id))
  {
    return invalid(format!("{} has already been retried", prev_id));
  }
  Ok(())
}
