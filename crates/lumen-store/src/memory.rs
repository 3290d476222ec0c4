use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;

use crate::transition::{
  Outcome, check_cancel, check_complete, check_fail, check_progress, check_requeue,
  validate_new_step_run, validate_new_task,
};
use crate::{
  Error, FailureKind, FlowRun, FlowRunFilter, FlowRunStatus, FlowStepRun, Store, Task, TaskFilter,
  TaskStatus,
};

/// Position of a pending task within its queue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
  priority: Reverse<i32>,
  created_at: DateTime<Utc>,
  seq: u64,
  task_id: String,
}

#[derive(Debug, Default)]
struct State {
  tasks: HashMap<String, Task>,
  /// Insertion order of each task, for stable ordering.
  task_seq: HashMap<String, u64>,
  /// Pending tasks per queue, best candidate first.
  pending: HashMap<String, BTreeSet<QueueKey>>,
  next_seq: u64,
  flow_runs: HashMap<String, FlowRun>,
  run_order: Vec<String>,
  step_runs: HashMap<String, FlowStepRun>,
  step_runs_by_run: HashMap<String, Vec<String>>,
}

impl State {
  fn key_for(&self, task: &Task) -> QueueKey {
    QueueKey {
      priority: Reverse(task.priority),
      created_at: task.created_at,
      seq: self.task_seq.get(&task.task_id).copied().unwrap_or_default(),
      task_id: task.task_id.clone(),
    }
  }

  fn index_pending(&mut self, task_id: &str) {
    let Some(task) = self.tasks.get(task_id) else {
      return;
    };
    let key = self.key_for(task);
    let queue = task.queue_name.clone();
    self.pending.entry(queue).or_default().insert(key);
  }

  fn unindex_pending(&mut self, task_id: &str) {
    let Some(task) = self.tasks.get(task_id) else {
      return;
    };
    let key = self.key_for(task);
    if let Some(queue) = self.pending.get_mut(&task.queue_name) {
      queue.remove(&key);
    }
  }

  fn task(&self, task_id: &str) -> Result<&Task, Error> {
    self
      .tasks
      .get(task_id)
      .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
  }

  fn task_mut(&mut self, task_id: &str) -> Result<&mut Task, Error> {
    self
      .tasks
      .get_mut(task_id)
      .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
  }

  fn flow_run_mut(&mut self, flow_run_id: &str) -> Result<&mut FlowRun, Error> {
    self
      .flow_runs
      .get_mut(flow_run_id)
      .ok_or_else(|| Error::NotFound(format!("flow run {}", flow_run_id)))
  }

  fn siblings(&self, flow_run_id: &str, step_index: i32) -> Vec<FlowStepRun> {
    self
      .step_runs_by_run
      .get(flow_run_id)
      .into_iter()
      .flatten()
      .filter_map(|id| self.step_runs.get(id))
      .filter(|s| s.step_index == step_index)
      .cloned()
      .collect()
  }
}

/// In-memory store.
///
/// Tasks live in an arena keyed by id; each queue keeps an ordered index of
/// its pending tasks so claiming is a single pass under one lock. Nothing is
/// persisted across restarts.
#[derive(Debug, Default)]
pub struct MemoryStore {
  state: Mutex<State>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, State>, Error> {
    self.state.lock().map_err(|_| Error::Poisoned)
  }
}

#[async_trait]
impl Store for MemoryStore {
  async fn create_task(&self, task: &Task) -> Result<(), Error> {
    validate_new_task(task)?;
    let mut state = self.lock()?;
    if state.tasks.contains_key(&task.task_id) {
      return Err(Error::InvalidTask(format!("{} already exists", task.task_id)));
    }
    let seq = state.next_seq;
    state.next_seq += 1;
    state.task_seq.insert(task.task_id.clone(), seq);
    state.tasks.insert(task.task_id.clone(), task.clone());
    state.index_pending(&task.task_id);
    Ok(())
  }

  async fn get_task(&self, task_id: &str) -> Result<Task, Error> {
    let state = self.lock()?;
    state.task(task_id).cloned()
  }

  async fn claim_task(
    &self,
    queue_name: &str,
    worker_id: &str,
    now: DateTime<Utc>,
  ) -> Result<Option<Task>, Error> {
    let mut state = self.lock()?;
    let State { pending, tasks, .. } = &mut *state;

    let Some(queue) = pending.get_mut(queue_name) else {
      return Ok(None);
    };
    let Some(key) = queue
      .iter()
      .find(|key| {
        tasks
          .get(&key.task_id)
          .is_some_and(|t| t.available_at <= now)
      })
      .cloned()
    else {
      return Ok(None);
    };
    queue.remove(&key);

    let Some(task) = tasks.get_mut(&key.task_id) else {
      return Ok(None);
    };
    task.status = TaskStatus::Running;
    task.worker_id = Some(worker_id.to_string());
    task.started_at = Some(now);
    Ok(Some(task.clone()))
  }

  async fn complete_task(
    &self,
    task_id: &str,
    worker_id: &str,
    result: &serde_json::Value,
  ) -> Result<Task, Error> {
    let mut state = self.lock()?;
    let task = state.task_mut(task_id)?;
    if check_complete(task, worker_id, result)? == Outcome::Apply {
      task.status = TaskStatus::Completed;
      task.result = Some(Json(result.clone()));
      task.progress_percentage = 100;
      task.completed_at = Some(Utc::now());
      task.error_message = None;
      task.failure_kind = None;
    }
    Ok(task.clone())
  }

  async fn fail_task(
    &self,
    task_id: &str,
    worker_id: &str,
    error: &str,
    kind: FailureKind,
  ) -> Result<Task, Error> {
    let mut state = self.lock()?;
    let task = state.task_mut(task_id)?;
    if check_fail(task, worker_id, error, kind)? == Outcome::Apply {
      task.status = TaskStatus::Failed;
      task.error_message = Some(error.to_string());
      task.failure_kind = Some(kind);
      task.completed_at = Some(Utc::now());
    }
    Ok(task.clone())
  }

  async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<Task, Error> {
    let mut state = self.lock()?;
    let outcome = check_cancel(state.task(task_id)?)?;
    if outcome == Outcome::Apply {
      state.unindex_pending(task_id);
      let task = state.task_mut(task_id)?;
      task.status = TaskStatus::Cancelled;
      task.error_message = Some(reason.to_string());
      task.completed_at = Some(Utc::now());
    }
    state.task(task_id).cloned()
  }

  async fn requeue_task(
    &self,
    task_id: &str,
    worker_id: &str,
    error: &str,
    available_at: DateTime<Utc>,
  ) -> Result<Task, Error> {
    let mut state = self.lock()?;
    {
      let task = state.task_mut(task_id)?;
      check_requeue(task, worker_id)?;
      task.status = TaskStatus::Pending;
      task.retry_count += 1;
      task.error_message = Some(error.to_string());
      task.worker_id = None;
      task.started_at = None;
      task.progress_percentage = 0;
      task.current_step = None;
      task.available_at = available_at;
    }
    state.index_pending(task_id);
    state.task(task_id).cloned()
  }

  async fn update_progress(
    &self,
    task_id: &str,
    worker_id: &str,
    percentage: i32,
    current_step: Option<&str>,
  ) -> Result<(), Error> {
    let mut state = self.lock()?;
    let task = state.task_mut(task_id)?;
    check_progress(task, worker_id, percentage)?;
    task.progress_percentage = percentage;
    task.current_step = current_step.map(str::to_string);
    Ok(())
  }

  async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, Error> {
    let state = self.lock()?;
    let mut tasks: Vec<(u64, Task)> = state
      .tasks
      .values()
      .filter(|t| filter.matches(t))
      .map(|t| {
        let seq = state.task_seq.get(&t.task_id).copied().unwrap_or_default();
        (seq, t.clone())
      })
      .collect();
    tasks.sort_by_key(|(seq, _)| *seq);
    Ok(tasks.into_iter().map(|(_, t)| t).collect())
  }

  async fn list_expired_tasks(&self, started_before: DateTime<Utc>) -> Result<Vec<Task>, Error> {
    let state = self.lock()?;
    let mut tasks: Vec<Task> = state
      .tasks
      .values()
      .filter(|t| t.status == TaskStatus::Running)
      .filter(|t| t.started_at.is_some_and(|s| s < started_before))
      .cloned()
      .collect();
    tasks.sort_by_key(|t| t.started_at);
    Ok(tasks)
  }

  async fn create_flow_run(&self, run: &FlowRun) -> Result<(), Error> {
    let mut state = self.lock()?;
    if state.flow_runs.contains_key(&run.flow_run_id) {
      return Err(Error::InvalidTask(format!(
        "flow run {} already exists",
        run.flow_run_id
      )));
    }
    state.run_order.push(run.flow_run_id.clone());
    state.flow_runs.insert(run.flow_run_id.clone(), run.clone());
    Ok(())
  }

  async fn get_flow_run(&self, flow_run_id: &str) -> Result<FlowRun, Error> {
    let state = self.lock()?;
    state
      .flow_runs
      .get(flow_run_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("flow run {}", flow_run_id)))
  }

  async fn advance_flow_run(
    &self,
    flow_run_id: &str,
    current_step: i32,
    current_task_id: &str,
  ) -> Result<(), Error> {
    let mut state = self.lock()?;
    let run = state.flow_run_mut(flow_run_id)?;
    if run.status.is_terminal() {
      return Err(Error::InvalidTransition {
        id: flow_run_id.to_string(),
        message: format!("cannot advance, run is {}", run.status.as_str()),
      });
    }
    run.status = FlowRunStatus::Running;
    run.current_step = current_step;
    run.current_task_id = Some(current_task_id.to_string());
    Ok(())
  }

  async fn finish_flow_run(
    &self,
    flow_run_id: &str,
    status: FlowRunStatus,
    error: Option<&str>,
  ) -> Result<bool, Error> {
    let mut state = self.lock()?;
    let run = state.flow_run_mut(flow_run_id)?;
    if run.status.is_terminal() {
      return Ok(false);
    }
    run.status = status;
    run.error = error.map(str::to_string);
    run.completed_at = Some(Utc::now());
    Ok(true)
  }

  async fn request_flow_run_cancel(&self, flow_run_id: &str) -> Result<FlowRun, Error> {
    let mut state = self.lock()?;
    let run = state.flow_run_mut(flow_run_id)?;
    if !run.status.is_terminal() {
      run.cancel_requested = true;
    }
    Ok(run.clone())
  }

  async fn list_flow_runs(&self, filter: &FlowRunFilter) -> Result<Vec<FlowRun>, Error> {
    let state = self.lock()?;
    Ok(
      state
        .run_order
        .iter()
        .filter_map(|id| state.flow_runs.get(id))
        .filter(|r| filter.matches(r))
        .cloned()
        .collect(),
    )
  }

  async fn delete_flow_run(&self, flow_run_id: &str) -> Result<(), Error> {
    let mut state = self.lock()?;
    if state.flow_runs.remove(flow_run_id).is_none() {
      return Err(Error::NotFound(format!("flow run {}", flow_run_id)));
    }
    state.run_order.retain(|id| id != flow_run_id);
    for step_run_id in state.step_runs_by_run.remove(flow_run_id).unwrap_or_default() {
      state.step_runs.remove(&step_run_id);
    }
    Ok(())
  }

  async fn create_step_run(&self, step_run: &FlowStepRun) -> Result<(), Error> {
    let mut state = self.lock()?;
    if !state.flow_runs.contains_key(&step_run.flow_run_id) {
      return Err(Error::NotFound(format!("flow run {}", step_run.flow_run_id)));
    }
    let siblings = state.siblings(&step_run.flow_run_id, step_run.step_index);
    validate_new_step_run(step_run, &siblings)?;
    state
      .step_runs_by_run
      .entry(step_run.flow_run_id.clone())
      .or_default()
      .push(step_run.step_run_id.clone());
    state
      .step_runs
      .insert(step_run.step_run_id.clone(), step_run.clone());
    Ok(())
  }

  async fn get_step_run(&self, step_run_id: &str) -> Result<FlowStepRun, Error> {
    let state = self.lock()?;
    state
      .step_runs
      .get(step_run_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("step run {}", step_run_id)))
  }

  async fn get_step_run_by_task(&self, task_id: &str) -> Result<FlowStepRun, Error> {
    let state = self.lock()?;
    state
      .step_runs
      .values()
      .find(|s| s.task_id == task_id)
      .cloned()
      .ok_or_else(|| Error::NotFound(format!("step run for task {}", task_id)))
  }

  async fn update_step_run(&self, step_run: &FlowStepRun) -> Result<(), Error> {
    let mut state = self.lock()?;
    let existing = state
      .step_runs
      .get_mut(&step_run.step_run_id)
      .ok_or_else(|| Error::NotFound(format!("step run {}", step_run.step_run_id)))?;
    existing.status = step_run.status;
    existing.output = step_run.output.clone();
    existing.error = step_run.error.clone();
    existing.started_at = step_run.started_at;
    existing.completed_at = step_run.completed_at;
    Ok(())
  }

  async fn list_step_runs(&self, flow_run_id: &str) -> Result<Vec<FlowStepRun>, Error> {
    let state = self.lock()?;
    let mut runs: Vec<FlowStepRun> = state
      .step_runs_by_run
      .get(flow_run_id)
      .into_iter()
      .flatten()
      .filter_map(|id| state.step_runs.get(id))
      .cloned()
      .collect();
    runs.sort_by_key(|s| (s.step_index, s.retry_attempt));
    Ok(runs)
  }
}
