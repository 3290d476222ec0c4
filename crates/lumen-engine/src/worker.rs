//! Worker pool: claim, execute, report.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{join_all, select_all};
use lumen_flow::{ProgressSink, StepContext, StepFailure, StepHandler};
use lumen_store::{FailureKind, Store, Task, TaskStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::retry::failure_kind;
use crate::tracker::{StepStart, Tracker};
use crate::transport::QueueTransport;

const UNREQUESTED_CANCEL: &str = "handler cancelled without a cancellation request";

/// A bounded set of executors, each running a claim, execute, report loop
/// over the configured queues.
///
/// Handlers run without any store lock held; the only coordination between
/// executors (here or in other processes) is the store's atomic claim.
pub struct WorkerPool {
  tracker: Arc<Tracker>,
  transport: Arc<dyn QueueTransport>,
  config: EngineConfig,
  name: String,
}

/// What to run for a claimed task.
struct Execution {
  handler: Arc<dyn StepHandler>,
  ctx: StepContext,
  inputs: serde_json::Value,
  timeout: Option<Duration>,
}

impl WorkerPool {
  pub fn new(
    tracker: Arc<Tracker>,
    transport: Arc<dyn QueueTransport>,
    config: EngineConfig,
  ) -> Self {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    Self {
      tracker,
      transport,
      config,
      name: format!("worker-{}", &suffix[..8]),
    }
  }

  /// Prefix for executor ids, which are `<name>-<n>`.
  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  fn store(&self) -> &Arc<dyn Store> {
    self.tracker.store()
  }

  /// Run executors until `shutdown` is cancelled.
  ///
  /// In-flight handlers are allowed to finish before this returns.
  pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
    let concurrency = self.config.concurrency.max(1);
    info!(
      worker = %self.name,
      concurrency,
      queues = ?self.config.queues,
      "starting worker pool"
    );

    let executors = (0..concurrency).map(|n| {
      let pool = self.clone();
      let worker_id = format!("{}-{}", self.name, n);
      let shutdown = shutdown.clone();
      tokio::spawn(async move { pool.executor_loop(worker_id, shutdown).await })
    });
    for result in join_all(executors).await {
      if let Err(e) = result {
        error!(error = %e, "executor panicked");
      }
    }
    info!(worker = %self.name, "worker pool stopped");
  }

  async fn executor_loop(&self, worker_id: String, shutdown: CancellationToken) {
    debug!(%worker_id, "executor started");
    while !shutdown.is_cancelled() {
      match self.claim_next(&worker_id).await {
        Ok(Some(task)) => {
          self.execute(&worker_id, task).await;
          continue;
        }
        Ok(None) => {}
        Err(e) => error!(%worker_id, error = %e, "failed to claim task"),
      }

      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = self.wait_for_work() => {}
      }
    }
    debug!(%worker_id, "executor stopped");
  }

  /// Claim from the first configured queue that has claimable work.
  pub async fn claim_next(&self, worker_id: &str) -> Result<Option<Task>, EngineError> {
    for queue in &self.config.queues {
      if let Some(task) = self.store().claim_task(queue, worker_id, Utc::now()).await? {
        return Ok(Some(task));
      }
    }
    Ok(None)
  }

  /// Wait for a wake-up on any served queue, or one poll interval.
  async fn wait_for_work(&self) {
    let interval = self.config.poll_interval();
    if self.config.queues.is_empty() {
      tokio::time::sleep(interval).await;
      return;
    }
    let pops = self
      .config
      .queues
      .iter()
      .map(|queue| self.transport.pop(queue, interval));
    let (result, _, _) = select_all(pops).await;
    if let Err(e) = result {
      warn!(error = %e, "queue transport unavailable, polling");
      tokio::time::sleep(interval).await;
    }
  }

  /// Execute one claimed task and record its outcome.
  ///
  /// Errors are logged, never returned: an unrecorded outcome leaves the task
  /// `running` until the reaper requeues it.
  #[instrument(
    name = "task_execute",
    skip(self, task),
    fields(
      task_id = %task.task_id,
      queue = %task.queue_name,
      flow_run_id = ?task.flow_run_id,
      attempt = task.retry_count,
    )
  )]
  pub async fn execute(&self, worker_id: &str, task: Task) {
    info!(task_name = %task.task_name, "task started");
    if let Err(e) = self.execute_inner(worker_id, &task).await {
      error!(error = %e, "failed to record task outcome");
    }
  }

  async fn execute_inner(&self, worker_id: &str, task: &Task) -> Result<(), EngineError> {
    let Some(execution) = self.prepare(worker_id, task).await? else {
      info!("run cancelled, skipping handler");
      self.record_cancelled(task).await?;
      return self.tracker.on_task_outcome(&task.task_id).await;
    };

    let mut outcome = tokio::select! {
      outcome = run_handler(execution) => outcome,
      _ = self.watch_cancellation(&task.task_id) => Err(StepFailure::Cancelled),
    };
    if matches!(outcome, Err(StepFailure::Cancelled)) && !self.cancellation_requested(task).await? {
      warn!("handler stopped without a cancellation request");
      outcome = Err(StepFailure::permanent(UNREQUESTED_CANCEL));
    }

    match outcome {
      Ok(output) => {
        info!("task completed");
        match self
          .store()
          .complete_task(&task.task_id, worker_id, &output)
          .await
        {
          Ok(_) => {}
          Err(e) if e.is_conflict() => warn!(error = %e, "task settled elsewhere, result dropped"),
          Err(e) => return Err(e.into()),
        }
      }
      Err(StepFailure::Cancelled) => {
        info!("task cancelled");
        self.record_cancelled(task).await?;
      }
      Err(failure) => {
        let kind = failure_kind(&failure).unwrap_or(FailureKind::Permanent);
        error!(error = %failure, "task failed");
        if task.flow_run_id.is_none() && self.tracker.retry_policy().should_retry(task, kind) {
          return self.requeue_standalone(worker_id, task, failure.message()).await;
        }
        match self
          .store()
          .fail_task(&task.task_id, worker_id, failure.message(), kind)
          .await
        {
          Ok(_) => {}
          Err(e) if e.is_conflict() => warn!(error = %e, "task settled elsewhere, failure dropped"),
          Err(e) => return Err(e.into()),
        }
      }
    }

    self.tracker.on_task_outcome(&task.task_id).await
  }

  /// Resolve the handler and context for a claimed task. `None` means skip.
  async fn prepare(&self, worker_id: &str, task: &Task) -> Result<Option<Execution>, EngineError> {
    let progress: Arc<dyn ProgressSink> = Arc::new(StoreProgress {
      store: self.store().clone(),
      task_id: task.task_id.clone(),
      worker_id: worker_id.to_string(),
    });
    let attempt = u32::try_from(task.retry_count).unwrap_or(0);

    let Some(flow_run_id) = task.flow_run_id.as_deref() else {
      let handler: Arc<dyn StepHandler> = match self.tracker.registry().handler(&task.task_type) {
        Some(handler) => handler,
        None => Arc::new(MissingHandler(task.task_type.clone())),
      };
      let ctx = StepContext::new(task.task_id.clone(), task.task_name.clone())
        .with_attempt(attempt)
        .with_progress(progress);
      return Ok(Some(Execution {
        handler,
        ctx,
        inputs: task.inputs.0.clone(),
        timeout: None,
      }));
    };

    match self.tracker.begin_step(task, flow_run_id).await? {
      StepStart::Skip => Ok(None),
      StepStart::Execute {
        step,
        attempt: step_attempt,
        cancel,
      } => {
        let ctx = StepContext::new(task.task_id.clone(), step.name())
          .with_flow_run(Some(flow_run_id.to_string()))
          .with_attempt(u32::try_from(step_attempt).unwrap_or(attempt))
          .with_config(step.def.config.clone())
          .with_cancel(cancel)
          .with_progress(progress);
        Ok(Some(Execution {
          handler: step.handler(),
          ctx,
          inputs: task.inputs.0.clone(),
          timeout: step.def.timeout_ms.map(Duration::from_millis),
        }))
      }
    }
  }

  /// Resolves once the task is found cancelled in the store, which covers
  /// cancellation requested from another process.
  async fn watch_cancellation(&self, task_id: &str) {
    let mut interval = tokio::time::interval(self.config.poll_interval());
    interval.tick().await;
    loop {
      interval.tick().await;
      match self.store().get_task(task_id).await {
        Ok(current) if current.status == TaskStatus::Cancelled => return,
        Ok(_) => {}
        Err(e) => debug!(error = %e, "cancellation check failed"),
      }
    }
  }

  /// Whether the task or its run was actually asked to stop.
  async fn cancellation_requested(&self, task: &Task) -> Result<bool, EngineError> {
    if self.store().get_task(&task.task_id).await?.status == TaskStatus::Cancelled {
      return Ok(true);
    }
    let Some(flow_run_id) = task.flow_run_id.as_deref() else {
      return Ok(false);
    };
    match self.store().get_flow_run(flow_run_id).await {
      Ok(run) => Ok(run.cancel_requested),
      Err(e) if e.is_not_found() => Ok(true),
      Err(e) => Err(e.into()),
    }
  }

  async fn record_cancelled(&self, task: &Task) -> Result<(), EngineError> {
    match self.store().cancel_task(&task.task_id, "cancelled").await {
      Ok(_) => Ok(()),
      Err(e) if e.is_conflict() => {
        warn!(error = %e, "task settled before cancellation");
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn requeue_standalone(
    &self,
    worker_id: &str,
    task: &Task,
    error: &str,
  ) -> Result<(), EngineError> {
    let policy = self.tracker.retry_policy();
    let failures = u32::try_from(task.retry_count).unwrap_or(0);
    let available_at = policy.next_available_at(Utc::now(), failures);
    match self
      .store()
      .requeue_task(&task.task_id, worker_id, error, available_at)
      .await
    {
      Ok(requeued) => {
        info!(
          retry_count = requeued.retry_count,
          available_at = %available_at,
          "task requeued"
        );
        self.tracker.dispatcher().wake(&requeued).await;
        Ok(())
      }
      Err(e) if e.is_conflict() => {
        warn!(error = %e, "task settled elsewhere, retry dropped");
        Ok(())
      }
      Err(e) => Err(e.into()),
    }
  }
}

/// Run a handler, turning an exceeded timeout into a transient failure.
async fn run_handler(execution: Execution) -> Result<serde_json::Value, StepFailure> {
  let Execution {
    handler,
    ctx,
    inputs,
    timeout,
  } = execution;
  ctx.checkpoint()?;
  let cancel = ctx.cancel_token().clone();
  let call = handler.execute(ctx, inputs);
  let call = async move {
    match timeout {
      Some(limit) => match tokio::time::timeout(limit, call).await {
        Ok(outcome) => outcome,
        Err(_) => Err(StepFailure::transient(format!(
          "timed out after {}ms",
          limit.as_millis()
        ))),
      },
      None => call.await,
    }
  };
  tokio::select! {
    biased;
    outcome = call => outcome,
    _ = cancel.cancelled() => Err(StepFailure::Cancelled),
  }
}

/// Reports handler progress onto the task row.
struct StoreProgress {
  store: Arc<dyn Store>,
  task_id: String,
  worker_id: String,
}

#[async_trait]
impl ProgressSink for StoreProgress {
  async fn report(&self, percentage: u8, label: Option<&str>) {
    if let Err(e) = self
      .store
      .update_progress(&self.task_id, &self.worker_id, i32::from(percentage), label)
      .await
    {
      debug!(task_id = %self.task_id, error = %e, "progress not recorded");
    }
  }
}

/// Stands in for a task type no handler is registered under.
struct MissingHandler(String);

#[async_trait]
impl StepHandler for MissingHandler {
  async fn execute(
    &self,
    _ctx: StepContext,
    _inputs: serde_json::Value,
  ) -> Result<serde_json::Value, StepFailure> {
    Err(StepFailure::permanent(format!(
      "no handler registered for '{}'",
      self.0
    )))
  }
}
