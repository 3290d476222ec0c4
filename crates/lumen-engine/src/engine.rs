//! Engine assembly.

use std::sync::Arc;

use lumen_flow::FlowRegistry;
use lumen_store::{FlowRun, Store, Task};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::dispatcher::Dispatcher;
use crate::error::EngineError;
use crate::events::{FlowNotifier, NoopNotifier};
use crate::reaper::Reaper;
use crate::retry::RetryPolicy;
use crate::tracker::Tracker;
use crate::transport::{MemoryTransport, QueueTransport};
use crate::worker::WorkerPool;

/// The tracker, worker pool and reaper wired to one store.
///
/// # Usage
///
/// ```ignore
/// let engine = Engine::builder(store, registry).config(config).build();
/// let run_id = engine.start("unit_content", inputs, Some("unit-1")).await?;
///
/// let shutdown = CancellationToken::new();
/// engine.run(shutdown).await?;
/// ```
pub struct Engine {
  tracker: Arc<Tracker>,
  pool: Arc<WorkerPool>,
  reaper: Reaper,
}

pub struct EngineBuilder {
  store: Arc<dyn Store>,
  registry: Arc<FlowRegistry>,
  transport: Option<Arc<dyn QueueTransport>>,
  notifier: Arc<dyn FlowNotifier>,
  retry: Option<RetryPolicy>,
  config: EngineConfig,
  worker_name: Option<String>,
}

impl EngineBuilder {
  pub fn config(mut self, config: EngineConfig) -> Self {
    self.config = config;
    self
  }

  pub fn transport(mut self, transport: Arc<dyn QueueTransport>) -> Self {
    self.transport = Some(transport);
    self
  }

  pub fn notifier(mut self, notifier: Arc<dyn FlowNotifier>) -> Self {
    self.notifier = notifier;
    self
  }

  /// Override the policy derived from the config's `retry` section.
  pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
    self.retry = Some(retry);
    self
  }

  pub fn worker_name(mut self, name: impl Into<String>) -> Self {
    self.worker_name = Some(name.into());
    self
  }

  pub fn build(self) -> Engine {
    let transport = self
      .transport
      .unwrap_or_else(|| Arc::new(MemoryTransport::new()));
    let retry = self
      .retry
      .unwrap_or_else(|| RetryPolicy::from_config(&self.config.retry));
    let dispatcher = Dispatcher::new(self.store, transport.clone());
    let tracker =
      Arc::new(Tracker::new(self.registry, dispatcher, retry).with_notifier(self.notifier));

    let mut pool = WorkerPool::new(tracker.clone(), transport, self.config.clone());
    if let Some(name) = self.worker_name {
      pool = pool.with_name(name);
    }
    let reaper = Reaper::new(
      tracker.clone(),
      self.config.lease(),
      self.config.reap_interval(),
    );

    Engine {
      tracker,
      pool: Arc::new(pool),
      reaper,
    }
  }
}

impl Engine {
  pub fn builder(store: Arc<dyn Store>, registry: Arc<FlowRegistry>) -> EngineBuilder {
    EngineBuilder {
      store,
      registry,
      transport: None,
      notifier: Arc::new(NoopNotifier),
      retry: None,
      config: EngineConfig::default(),
      worker_name: None,
    }
  }

  pub fn tracker(&self) -> &Arc<Tracker> {
    &self.tracker
  }

  pub fn pool(&self) -> &Arc<WorkerPool> {
    &self.pool
  }

  pub fn reaper(&self) -> &Reaper {
    &self.reaper
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    self.tracker.store()
  }

  /// Start a flow run. See [`Tracker::start`].
  pub async fn start(
    &self,
    flow_name: &str,
    inputs: serde_json::Value,
    owner_id: Option<&str>,
  ) -> Result<String, EngineError> {
    self.tracker.start(flow_name, inputs, owner_id).await
  }

  /// Enqueue a standalone task, executed by the handler named by its `task_type`.
  pub async fn enqueue(&self, task: &Task) -> Result<(), EngineError> {
    self.tracker.dispatcher().enqueue(task).await
  }

  pub async fn cancel(&self, flow_run_id: &str) -> Result<FlowRun, EngineError> {
    self.tracker.cancel(flow_run_id).await
  }

  /// Recover unfinished runs, then serve queues and reap leases until
  /// `shutdown` is cancelled.
  pub async fn run(&self, shutdown: CancellationToken) -> Result<(), EngineError> {
    let repaired = self.tracker.recover().await?;
    info!(repaired, "engine starting");
    tokio::join!(
      self.pool.clone().run(shutdown.clone()),
      self.reaper.run(shutdown.clone())
    );
    Ok(())
  }
}
