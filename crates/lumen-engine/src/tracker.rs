//! Flow run state transitions.
//!
//! The tracker turns task outcomes into flow run progress: it creates step
//! attempts, derives their inputs, applies the retry policy and settles runs.
//!
//! Transitions for one run are serialized through a per-run lock, and each
//! decision first checks what is already recorded. Replaying an outcome is
//! therefore a no-op once its successor attempt exists or the run is settled.
//!
//! A new attempt is written in this order: step run, run pointer, task. A
//! crash in between leaves a step run whose task is missing, which
//! [`Tracker::recover`] recreates.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use lumen_flow::{Flow, FlowRegistry, Step, accumulate, resolve_step_inputs};
use lumen_store::{
  DEFAULT_QUEUE, FlowRun, FlowRunFilter, FlowRunStatus, FlowStepRun, StepRunStatus, Store, Task,
  TaskFilter, TaskStatus,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::events::{FlowEvent, FlowNotifier, NoopNotifier};
use crate::retry::RetryPolicy;

type RunLock = Arc<tokio::sync::Mutex<()>>;

const CANCELLED: &str = "flow run cancelled";

/// What a worker should do with a claimed flow task.
#[derive(Debug)]
pub enum StepStart {
  /// Run the step's handler.
  Execute {
    step: Step,
    attempt: i32,
    /// Cancelled when the run is cancelled from this process.
    cancel: CancellationToken,
  },
  /// The run is cancelled or gone; skip the handler.
  Skip,
}

pub struct Tracker {
  store: Arc<dyn Store>,
  registry: Arc<FlowRegistry>,
  dispatcher: Dispatcher,
  retry: RetryPolicy,
  notifier: Arc<dyn FlowNotifier>,
  run_locks: Mutex<HashMap<String, RunLock>>,
  cancellations: Mutex<HashMap<String, CancellationToken>>,
}

impl Tracker {
  pub fn new(registry: Arc<FlowRegistry>, dispatcher: Dispatcher, retry: RetryPolicy) -> Self {
    Self {
      store: dispatcher.store().clone(),
      registry,
      dispatcher,
      retry,
      notifier: Arc::new(NoopNotifier),
      run_locks: Mutex::new(HashMap::new()),
      cancellations: Mutex::new(HashMap::new()),
    }
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn FlowNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  pub fn registry(&self) -> &Arc<FlowRegistry> {
    &self.registry
  }

  pub fn dispatcher(&self) -> &Dispatcher {
    &self.dispatcher
  }

  pub fn retry_policy(&self) -> &RetryPolicy {
    &self.retry
  }

  fn run_lock(&self, flow_run_id: &str) -> RunLock {
    let mut locks = self.run_locks.lock().unwrap_or_else(PoisonError::into_inner);
    locks.entry(flow_run_id.to_string()).or_default().clone()
  }

  fn cancellation(&self, flow_run_id: &str) -> CancellationToken {
    let mut tokens = self
      .cancellations
      .lock()
      .unwrap_or_else(PoisonError::into_inner);
    tokens.entry(flow_run_id.to_string()).or_default().clone()
  }

  fn forget_run(&self, flow_run_id: &str) {
    self
      .run_locks
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(flow_run_id);
    self
      .cancellations
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(flow_run_id);
  }

  /// Create a run of `flow_name` and schedule its first step.
  ///
  /// `inputs` must be a JSON object (or null for none). Returns the run id.
  #[instrument(skip(self, inputs), fields(flow = %flow_name))]
  pub async fn start(
    &self,
    flow_name: &str,
    inputs: serde_json::Value,
    owner_id: Option<&str>,
  ) -> Result<String, EngineError> {
    let flow = self.registry.get(flow_name)?;
    let inputs = match inputs {
      serde_json::Value::Null => serde_json::Value::Object(serde_json::Map::new()),
      serde_json::Value::Object(_) => inputs,
      _ => {
        return Err(EngineError::InvalidInputs {
          flow: flow_name.to_string(),
          message: "initial inputs must be a JSON object".to_string(),
        });
      }
    };

    let run = FlowRun::new(flow_name, inputs).with_owner(owner_id.map(str::to_string));
    let lock = self.run_lock(&run.flow_run_id);
    let _guard = lock.lock().await;

    self.store.create_flow_run(&run).await?;
    info!(flow_run_id = %run.flow_run_id, owner_id = ?run.owner_id, "flow run created");
    self.notifier.notify(FlowEvent::RunStarted {
      flow_run_id: run.flow_run_id.clone(),
      flow_name: run.flow_name.clone(),
      owner_id: run.owner_id.clone(),
    });

    let context = accumulate(&run.inputs.0, std::iter::empty());
    self.dispatch_first_attempt(&flow, &run, 0, &context).await?;
    Ok(run.flow_run_id)
  }

  /// Apply the recorded outcome of a settled task to its flow run.
  ///
  /// Safe to call more than once for the same task, and a no-op for
  /// standalone tasks and tasks that are not settled yet.
  #[instrument(skip(self))]
  pub async fn on_task_outcome(&self, task_id: &str) -> Result<(), EngineError> {
    let task = self.store.get_task(task_id).await?;
    let Some(flow_run_id) = task.flow_run_id.clone() else {
      return Ok(());
    };
    if !task.status.is_terminal() {
      debug!(status = task.status.as_str(), "task not settled");
      return Ok(());
    }

    let lock = self.run_lock(&flow_run_id);
    let _guard = lock.lock().await;

    let Some(run) = self.find_run(&flow_run_id).await? else {
      return Ok(());
    };
    let step_run = match self.store.get_step_run_by_task(task_id).await {
      Ok(step_run) => step_run,
      Err(e) if e.is_not_found() => {
        warn!(%flow_run_id, "no step run for task");
        return Ok(());
      }
      Err(e) => return Err(e.into()),
    };

    let step_run = self.record_outcome(step_run, &task).await?;
    if run.status.is_terminal() {
      self.forget_run(&flow_run_id);
      return Ok(());
    }
    let flow = self.registry.get(&run.flow_name)?;
    self.apply_outcome(&flow, &run, &step_run, &task).await
  }

  /// Mark the step run of a claimed task as running.
  ///
  /// Returns [`StepStart::Skip`] when the run was cancelled or deleted, in
  /// which case the handler must not be invoked.
  pub async fn begin_step(&self, task: &Task, flow_run_id: &str) -> Result<StepStart, EngineError> {
    let lock = self.run_lock(flow_run_id);
    let _guard = lock.lock().await;

    let Some(run) = self.find_run(flow_run_id).await? else {
      return Ok(StepStart::Skip);
    };
    if run.cancel_requested || run.status.is_terminal() {
      return Ok(StepStart::Skip);
    }
    let mut step_run = match self.store.get_step_run_by_task(&task.task_id).await {
      Ok(step_run) => step_run,
      Err(e) if e.is_not_found() => {
        warn!(%flow_run_id, task_id = %task.task_id, "no step run for task");
        return Ok(StepStart::Skip);
      }
      Err(e) => return Err(e.into()),
    };

    let flow = self.registry.get(&run.flow_name)?;
    let step = step_of(&flow, &step_run)?.clone();

    if step_run.status == StepRunStatus::Pending {
      step_run.status = StepRunStatus::Running;
      step_run.started_at = task.started_at.or_else(|| Some(Utc::now()));
      self.store.update_step_run(&step_run).await?;
    }
    self.notifier.notify(FlowEvent::StepStarted {
      flow_run_id: flow_run_id.to_string(),
      step: step_run.step_name.clone(),
      attempt: step_run.retry_attempt,
      task_id: task.task_id.clone(),
    });

    Ok(StepStart::Execute {
      step,
      attempt: step_run.retry_attempt,
      cancel: self.cancellation(flow_run_id).child_token(),
    })
  }

  /// Return the step run of a requeued task to `pending`.
  pub async fn on_task_requeued(&self, task: &Task) -> Result<(), EngineError> {
    let Some(flow_run_id) = task.flow_run_id.as_deref() else {
      return Ok(());
    };
    let lock = self.run_lock(flow_run_id);
    let _guard = lock.lock().await;

    match self.store.get_step_run_by_task(&task.task_id).await {
      Ok(mut step_run) if step_run.status == StepRunStatus::Running => {
        step_run.status = StepRunStatus::Pending;
        step_run.started_at = None;
        self.store.update_step_run(&step_run).await?;
        Ok(())
      }
      Ok(_) => Ok(()),
      Err(e) if e.is_not_found() => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  /// Cancel a run: settle its unfinished tasks and step runs, then the run.
  ///
  /// Handlers running in this process observe the cancellation through their
  /// context; workers elsewhere find the task cancelled when they next check.
  #[instrument(skip(self))]
  pub async fn cancel(&self, flow_run_id: &str) -> Result<FlowRun, EngineError> {
    let lock = self.run_lock(flow_run_id);
    let _guard = lock.lock().await;

    let run = self.store.request_flow_run_cancel(flow_run_id).await?;
    if run.status.is_terminal() {
      return Ok(run);
    }
    self.cancel_locked(&run).await?;
    Ok(self.store.get_flow_run(flow_run_id).await?)
  }

  async fn cancel_locked(&self, run: &FlowRun) -> Result<(), EngineError> {
    self.cancellation(&run.flow_run_id).cancel();

    let filter = TaskFilter {
      flow_run_id: Some(run.flow_run_id.clone()),
      ..Default::default()
    };
    for task in self.store.list_tasks(&filter).await? {
      if task.status.is_terminal() {
        continue;
      }
      match self.store.cancel_task(&task.task_id, CANCELLED).await {
        Ok(_) => debug!(task_id = %task.task_id, "task cancelled"),
        // Settled in the meantime; its outcome is recorded below.
        Err(e) if e.is_conflict() => {}
        Err(e) => return Err(e.into()),
      }
    }

    for step_run in self.store.list_step_runs(&run.flow_run_id).await? {
      if step_run.status.is_terminal() {
        continue;
      }
      match self.store.get_task(&step_run.task_id).await {
        Ok(task) => {
          self.record_outcome(step_run, &task).await?;
        }
        Err(e) if e.is_not_found() => {
          let mut step_run = step_run;
          step_run.status = StepRunStatus::Cancelled;
          step_run.error = Some(CANCELLED.to_string());
          step_run.completed_at = Some(Utc::now());
          self.store.update_step_run(&step_run).await?;
        }
        Err(e) => return Err(e.into()),
      }
    }

    self
      .finish(run, FlowRunStatus::Cancelled, Some(CANCELLED))
      .await
  }

  /// Bring every unfinished run back in line with its recorded state.
  ///
  /// Replays outcomes that were recorded on tasks but not applied to their
  /// runs, recreates tasks that were never written, and finishes runs whose
  /// cancellation was interrupted. Returns the number of runs repaired.
  pub async fn recover(&self) -> Result<usize, EngineError> {
    self.recover_runs(None).await
  }

  /// Like [`Tracker::recover`], for use while other workers are live.
  ///
  /// A missing task is only recreated when its step run was written before
  /// `scheduled_before`; younger step runs may still be mid-schedule in
  /// another process.
  pub async fn recover_stalled(
    &self,
    scheduled_before: DateTime<Utc>,
  ) -> Result<usize, EngineError> {
    self.recover_runs(Some(scheduled_before)).await
  }

  async fn recover_runs(
    &self,
    scheduled_before: Option<DateTime<Utc>>,
  ) -> Result<usize, EngineError> {
    let mut repaired = 0;
    for status in [FlowRunStatus::Pending, FlowRunStatus::Running] {
      let filter = FlowRunFilter {
        status: Some(status),
        ..Default::default()
      };
      for run in self.store.list_flow_runs(&filter).await? {
        match self.resume(&run.flow_run_id, scheduled_before).await {
          Ok(true) => repaired += 1,
          Ok(false) => {}
          Err(e) => {
            warn!(flow_run_id = %run.flow_run_id, error = %e, "failed to resume flow run");
          }
        }
      }
    }
    if repaired > 0 {
      info!(repaired, "flow run recovery finished");
    } else {
      debug!("flow run recovery found nothing to repair");
    }
    Ok(repaired)
  }

  async fn resume(
    &self,
    flow_run_id: &str,
    scheduled_before: Option<DateTime<Utc>>,
  ) -> Result<bool, EngineError> {
    let lock = self.run_lock(flow_run_id);
    let _guard = lock.lock().await;

    let mut repaired = false;
    let mut last_frontier: Option<String> = None;
    loop {
      let Some(run) = self.find_run(flow_run_id).await? else {
        return Ok(repaired);
      };
      if run.status.is_terminal() {
        self.forget_run(flow_run_id);
        return Ok(repaired);
      }
      if run.cancel_requested {
        self.cancel_locked(&run).await?;
        return Ok(true);
      }

      let flow = self.registry.get(&run.flow_name)?;
      let step_runs = self.store.list_step_runs(flow_run_id).await?;
      let Some(frontier) = step_runs
        .iter()
        .max_by_key(|s| (s.step_index, s.retry_attempt))
        .cloned()
      else {
        let context = accumulate(&run.inputs.0, std::iter::empty());
        self.dispatch_first_attempt(&flow, &run, 0, &context).await?;
        return Ok(true);
      };
      if last_frontier.as_deref() == Some(frontier.step_run_id.as_str()) {
        return Ok(repaired);
      }
      last_frontier = Some(frontier.step_run_id.clone());

      let task = match self.store.get_task(&frontier.task_id).await {
        Ok(task) => task,
        Err(e) if e.is_not_found() => {
          if scheduled_before.is_some_and(|cutoff| frontier.created_at > cutoff) {
            return Ok(repaired);
          }
          let task = self.rebuild_task(&flow, &run, &frontier, &step_runs).await?;
          info!(%flow_run_id, task_id = %task.task_id, "recreating missing task");
          self
            .store
            .advance_flow_run(flow_run_id, frontier.step_index, &task.task_id)
            .await?;
          self.dispatcher.create(&task).await?;
          self.dispatcher.wake(&task).await;
          return Ok(true);
        }
        Err(e) => return Err(e.into()),
      };

      if run.current_task_id.as_deref() != Some(task.task_id.as_str()) {
        self
          .store
          .advance_flow_run(flow_run_id, frontier.step_index, &task.task_id)
          .await?;
        repaired = true;
      }
      if !task.status.is_terminal() {
        return Ok(repaired);
      }

      debug!(%flow_run_id, task_id = %task.task_id, "replaying task outcome");
      let step_run = self.record_outcome(frontier, &task).await?;
      self.apply_outcome(&flow, &run, &step_run, &task).await?;
      repaired = true;
    }
  }

  async fn find_run(&self, flow_run_id: &str) -> Result<Option<FlowRun>, EngineError> {
    match self.store.get_flow_run(flow_run_id).await {
      Ok(run) => Ok(Some(run)),
      Err(e) if e.is_not_found() => {
        warn!(%flow_run_id, "flow run no longer exists");
        Ok(None)
      }
      Err(e) => Err(e.into()),
    }
  }

  /// Copy a settled task's outcome onto its step run, once.
  async fn record_outcome(
    &self,
    mut step_run: FlowStepRun,
    task: &Task,
  ) -> Result<FlowStepRun, EngineError> {
    if step_run.status.is_terminal() {
      return Ok(step_run);
    }
    step_run.status = match task.status {
      TaskStatus::Completed => StepRunStatus::Completed,
      TaskStatus::Failed => StepRunStatus::Failed,
      TaskStatus::Cancelled => StepRunStatus::Cancelled,
      TaskStatus::Pending | TaskStatus::Running => return Ok(step_run),
    };
    if task.status == TaskStatus::Completed {
      step_run.output = task.result.clone();
    } else {
      step_run.error = task.error_message.clone();
    }
    step_run.started_at = step_run.started_at.or(task.started_at);
    step_run.completed_at = task.completed_at.or_else(|| Some(Utc::now()));
    self.store.update_step_run(&step_run).await?;

    match step_run.status {
      StepRunStatus::Completed => self.notifier.notify(FlowEvent::StepCompleted {
        flow_run_id: step_run.flow_run_id.clone(),
        step: step_run.step_name.clone(),
        attempt: step_run.retry_attempt,
      }),
      StepRunStatus::Failed => self.notifier.notify(FlowEvent::StepFailed {
        flow_run_id: step_run.flow_run_id.clone(),
        step: step_run.step_name.clone(),
        attempt: step_run.retry_attempt,
        error: step_run.error.clone().unwrap_or_default(),
      }),
      _ => {}
    }
    Ok(step_run)
  }

  async fn apply_outcome(
    &self,
    flow: &Flow,
    run: &FlowRun,
    step_run: &FlowStepRun,
    task: &Task,
  ) -> Result<(), EngineError> {
    if run.cancel_requested {
      return self
        .finish(run, FlowRunStatus::Cancelled, Some(CANCELLED))
        .await;
    }
    let step_runs = self.store.list_step_runs(&run.flow_run_id).await?;
    match task.status {
      TaskStatus::Completed => self.after_success(flow, run, step_run, &step_runs).await,
      TaskStatus::Failed => self.after_failure(flow, run, step_run, task, &step_runs).await,
      // Cancelled without a request on the run: the attempt is not retried.
      _ => {
        let error = task.error_message.as_deref().unwrap_or("task cancelled");
        self.settle_failed(run, &step_runs, error).await
      }
    }
  }

  async fn after_success(
    &self,
    flow: &Flow,
    run: &FlowRun,
    step_run: &FlowStepRun,
    step_runs: &[FlowStepRun],
  ) -> Result<(), EngineError> {
    let next = usize::try_from(step_run.step_index + 1).unwrap_or(usize::MAX);
    if next >= flow.len() {
      return self.finish(run, FlowRunStatus::Completed, None).await;
    }
    if step_runs
      .iter()
      .any(|s| s.step_index == step_run.step_index + 1)
    {
      debug!(flow_run_id = %run.flow_run_id, next, "next step already scheduled");
      return Ok(());
    }
    let context = step_context(&run.inputs.0, step_runs, step_run.step_index + 1);
    self.dispatch_first_attempt(flow, run, next, &context).await
  }

  async fn after_failure(
    &self,
    flow: &Flow,
    run: &FlowRun,
    step_run: &FlowStepRun,
    task: &Task,
    step_runs: &[FlowStepRun],
  ) -> Result<(), EngineError> {
    if step_runs
      .iter()
      .any(|s| s.retry_of_step_run_id.as_deref() == Some(step_run.step_run_id.as_str()))
    {
      debug!(flow_run_id = %run.flow_run_id, step = %step_run.step_name, "retry already scheduled");
      return Ok(());
    }

    if self.retry.should_retry_failed(task) {
      let step = step_of(flow, step_run)?;
      let failures = u32::try_from(task.retry_count).unwrap_or(0);
      let available_at = self.retry.next_available_at(Utc::now(), failures);
      let retry_task = self.step_task(
        flow,
        run,
        step,
        step_run.inputs.0.clone(),
        task.max_retries,
        task.retry_count + 1,
        available_at,
      );
      let retry = FlowStepRun::retry_of(step_run, retry_task.task_id.clone());
      self.schedule(run, &retry, &retry_task).await?;

      info!(
        flow_run_id = %run.flow_run_id,
        step = %retry.step_name,
        attempt = retry.retry_attempt,
        available_at = %available_at,
        "step retry scheduled"
      );
      self.notifier.notify(FlowEvent::StepRetried {
        flow_run_id: run.flow_run_id.clone(),
        step: retry.step_name.clone(),
        attempt: retry.retry_attempt,
        task_id: retry_task.task_id.clone(),
      });
      return Ok(());
    }

    let error = task.error_message.as_deref().unwrap_or("step failed");
    self.settle_failed(run, step_runs, error).await
  }

  /// Finish a run whose current step cannot succeed.
  async fn settle_failed(
    &self,
    run: &FlowRun,
    step_runs: &[FlowStepRun],
    error: &str,
  ) -> Result<(), EngineError> {
    let status = if step_runs
      .iter()
      .any(|s| s.status == StepRunStatus::Completed)
    {
      FlowRunStatus::Partial
    } else {
      FlowRunStatus::Failed
    };
    self.finish(run, status, Some(error)).await
  }

  /// Schedule attempt 0 of step `index`, or settle the run if its inputs
  /// cannot be derived.
  async fn dispatch_first_attempt(
    &self,
    flow: &Flow,
    run: &FlowRun,
    index: usize,
    context: &serde_json::Value,
  ) -> Result<(), EngineError> {
    let Some(step) = flow.step(index) else {
      return self.finish(run, FlowRunStatus::Completed, None).await;
    };
    let step_index = i32::try_from(index).unwrap_or(i32::MAX);

    let payload = match resolve_step_inputs(&step.def, context) {
      Ok(payload) => payload,
      Err(e) => {
        let error = e.to_string();
        warn!(flow_run_id = %run.flow_run_id, step = step.name(), %error, "step inputs unavailable");
        self.notifier.notify(FlowEvent::StepFailed {
          flow_run_id: run.flow_run_id.clone(),
          step: step.name().to_string(),
          attempt: 0,
          error: error.clone(),
        });
        let status = if index == 0 {
          FlowRunStatus::Failed
        } else {
          FlowRunStatus::Partial
        };
        return self.finish(run, status, Some(&error)).await;
      }
    };

    let max_retries = flow.max_retries_for(step, self.retry.default_max_retries);
    let task = self.step_task(
      flow,
      run,
      step,
      payload.clone(),
      i32::try_from(max_retries).unwrap_or(i32::MAX),
      0,
      Utc::now(),
    );
    let step_run = FlowStepRun::first_attempt(
      run.flow_run_id.clone(),
      step_index,
      step.name(),
      task.task_id.clone(),
      payload,
    );
    self.schedule(run, &step_run, &task).await?;
    debug!(flow_run_id = %run.flow_run_id, step = step.name(), task_id = %task.task_id, "step scheduled");
    Ok(())
  }

  async fn schedule(
    &self,
    run: &FlowRun,
    step_run: &FlowStepRun,
    task: &Task,
  ) -> Result<(), EngineError> {
    self.store.create_step_run(step_run).await?;
    self
      .store
      .advance_flow_run(&run.flow_run_id, step_run.step_index, &task.task_id)
      .await?;
    self.dispatcher.create(task).await?;
    self.dispatcher.wake(task).await;
    Ok(())
  }

  #[allow(clippy::too_many_arguments)]
  fn step_task(
    &self,
    flow: &Flow,
    run: &FlowRun,
    step: &Step,
    payload: serde_json::Value,
    max_retries: i32,
    retry_count: i32,
    available_at: DateTime<Utc>,
  ) -> Task {
    let mut task = Task::new(
      format!("{}.{}", flow.name, step.name()),
      step.def.handler.clone(),
      payload,
    )
    .with_queue(flow.queue_for(step, DEFAULT_QUEUE))
    .with_priority(step.def.priority.unwrap_or(0))
    .with_max_retries(max_retries)
    .with_retry_count(retry_count)
    .with_flow_run(run.flow_run_id.clone())
    .available_at(available_at);
    if let Some(owner_id) = &run.owner_id {
      task = task.with_owner(owner_id.clone());
    }
    task
  }

  /// Rebuild the task of a step run whose task was never written.
  async fn rebuild_task(
    &self,
    flow: &Flow,
    run: &FlowRun,
    step_run: &FlowStepRun,
    step_runs: &[FlowStepRun],
  ) -> Result<Task, EngineError> {
    let step = step_of(flow, step_run)?;
    let previous = step_run
      .retry_of_step_run_id
      .as_deref()
      .and_then(|id| step_runs.iter().find(|s| s.step_run_id == id));

    let (max_retries, retry_count) = match previous {
      Some(previous) => {
        let failed = self.store.get_task(&previous.task_id).await?;
        (failed.max_retries, (failed.retry_count + 1).min(failed.max_retries))
      }
      None => {
        let max = flow.max_retries_for(step, self.retry.default_max_retries);
        (i32::try_from(max).unwrap_or(i32::MAX), 0)
      }
    };

    let mut task = self.step_task(
      flow,
      run,
      step,
      step_run.inputs.0.clone(),
      max_retries,
      retry_count,
      Utc::now(),
    );
    task.task_id = step_run.task_id.clone();
    Ok(task)
  }

  async fn finish(
    &self,
    run: &FlowRun,
    status: FlowRunStatus,
    error: Option<&str>,
  ) -> Result<(), EngineError> {
    if self
      .store
      .finish_flow_run(&run.flow_run_id, status, error)
      .await?
    {
      info!(
        flow_run_id = %run.flow_run_id,
        status = status.as_str(),
        error = error.unwrap_or(""),
        "flow run finished"
      );
      self.notifier.notify(FlowEvent::RunFinished {
        flow_run_id: run.flow_run_id.clone(),
        owner_id: run.owner_id.clone(),
        status,
        error: error.map(str::to_string),
      });
    }
    self.forget_run(&run.flow_run_id);
    Ok(())
  }
}

fn step_of<'a>(flow: &'a Flow, step_run: &FlowStepRun) -> Result<&'a Step, EngineError> {
  usize::try_from(step_run.step_index)
    .ok()
    .and_then(|index| flow.step(index))
    .ok_or_else(|| EngineError::UnknownStep {
      flow: flow.name.clone(),
      index: step_run.step_index,
    })
}

/// Context for step `next`: initial inputs plus the output of the latest
/// successful attempt of every earlier step, in step order.
fn step_context(
  initial: &serde_json::Value,
  step_runs: &[FlowStepRun],
  next: i32,
) -> serde_json::Value {
  let mut latest: BTreeMap<i32, &FlowStepRun> = BTreeMap::new();
  for step_run in step_runs
    .iter()
    .filter(|s| s.step_index < next && s.status == StepRunStatus::Completed)
  {
    let entry = latest.entry(step_run.step_index).or_insert(step_run);
    if step_run.retry_attempt > entry.retry_attempt {
      *entry = step_run;
    }
  }
  accumulate(
    initial,
    latest
      .values()
      .filter_map(|s| s.output.as_ref().map(|o| (s.step_name.as_str(), &o.0))),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use lumen_store::Json;
  use serde_json::json;

  fn completed(index: i32, attempt: i32, name: &str, output: serde_json::Value) -> FlowStepRun {
    let task_id = format!("t{}-{}", index, attempt);
    let mut step_run = FlowStepRun::first_attempt("r1", index, name, task_id, json!({}));
    step_run.retry_attempt = attempt;
    step_run.status = StepRunStatus::Completed;
    step_run.output = Some(Json(output));
    step_run
  }

  #[test]
  fn test_step_context_uses_latest_success_in_order() {
    let mut failed = completed(1, 0, "lessons", json!({"lessons": "stale"}));
    failed.status = StepRunStatus::Failed;
    let step_runs = vec![
      completed(0, 0, "outline", json!({"outline": ["a"], "topic": "override"})),
      failed,
      completed(1, 1, "lessons", json!({"lessons": ["l1"]})),
      completed(2, 0, "quiz", json!({"quiz": true})),
    ];

    let context = step_context(&json!({"topic": "tides"}), &step_runs, 2);
    assert_eq!(
      context,
      json!({"topic": "override", "outline": ["a"], "lessons": ["l1"]})
    );
  }

  #[test]
  fn test_step_context_stores_scalar_outputs_under_step_name() {
    let step_runs = vec![completed(0, 0, "summary", json!("short"))];
    let context = step_context(&json!({"topic": "tides"}), &step_runs, 1);
    assert_eq!(context, json!({"topic": "tides", "summary": "short"}));
  }
}
