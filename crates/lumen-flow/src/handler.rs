//! Step handlers and the context they run with.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::FlowError;

/// Classified failure returned by a handler.
///
/// The classification is the handler's call; the engine never infers it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepFailure {
  /// Network errors, timeouts, rate limits. Retried while budget remains.
  #[error("transient failure: {0}")]
  Transient(String),

  /// Invalid input or schema mismatch. Never retried.
  #[error("permanent failure: {0}")]
  Permanent(String),

  /// The handler stopped at a checkpoint because its run was cancelled.
  #[error("cancelled")]
  Cancelled,
}

impl StepFailure {
  pub fn transient(message: impl fmt::Display) -> Self {
    Self::Transient(message.to_string())
  }

  pub fn permanent(message: impl fmt::Display) -> Self {
    Self::Permanent(message.to_string())
  }

  pub fn is_transient(&self) -> bool {
    matches!(self, Self::Transient(_))
  }

  /// The handler's message, without the classification prefix.
  pub fn message(&self) -> &str {
    match self {
      Self::Transient(message) | Self::Permanent(message) => message,
      Self::Cancelled => "cancelled",
    }
  }
}

/// Receives progress reports from a running handler.
#[async_trait]
pub trait ProgressSink: Send + Sync {
  async fn report(&self, percentage: u8, label: Option<&str>);
}

/// Discards progress reports.
#[derive(Debug, Clone, Default)]
pub struct NoopProgress;

#[async_trait]
impl ProgressSink for NoopProgress {
  async fn report(&self, _percentage: u8, _label: Option<&str>) {}
}

/// Everything a handler knows about the attempt it is executing.
#[derive(Clone)]
pub struct StepContext {
  pub task_id: String,
  /// Set when the task backs a flow step.
  pub flow_run_id: Option<String>,
  pub step_name: String,
  pub attempt: u32,
  /// The step's `config` block from its definition.
  pub config: serde_json::Value,
  cancel: CancellationToken,
  progress: Arc<dyn ProgressSink>,
}

impl StepContext {
  pub fn new(task_id: impl Into<String>, step_name: impl Into<String>) -> Self {
    Self {
      task_id: task_id.into(),
      flow_run_id: None,
      step_name: step_name.into(),
      attempt: 0,
      config: serde_json::Value::Null,
      cancel: CancellationToken::new(),
      progress: Arc::new(NoopProgress),
    }
  }

  pub fn with_flow_run(mut self, flow_run_id: Option<String>) -> Self {
    self.flow_run_id = flow_run_id;
    self
  }

  pub fn with_attempt(mut self, attempt: u32) -> Self {
    self.attempt = attempt;
    self
  }

  pub fn with_config(mut self, config: serde_json::Value) -> Self {
    self.config = config;
    self
  }

  pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
    self.progress = progress;
    self
  }

  pub fn cancel_token(&self) -> &CancellationToken {
    &self.cancel
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancel.is_cancelled()
  }

  /// Return early from a handler when the run has been cancelled.
  pub fn checkpoint(&self) -> Result<(), StepFailure> {
    if self.cancel.is_cancelled() {
      return Err(StepFailure::Cancelled);
    }
    Ok(())
  }

  /// Report progress; values above 100 are clamped.
  pub async fn report_progress(&self, percentage: u8, label: Option<&str>) {
    self.progress.report(percentage.min(100), label).await;
  }
}

impl fmt::Debug for StepContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StepContext")
      .field("task_id", &self.task_id)
      .field("flow_run_id", &self.flow_run_id)
      .field("step_name", &self.step_name)
      .field("attempt", &self.attempt)
      .finish_non_exhaustive()
  }
}

/// Executes one step: structured input in, structured output or a
/// classified failure out.
#[async_trait]
pub trait StepHandler: Send + Sync {
  async fn execute(
    &self,
    ctx: StepContext,
    inputs: serde_json::Value,
  ) -> Result<serde_json::Value, StepFailure>;
}

/// Adapts an async closure into a [`StepHandler`].
pub struct FnHandler<F> {
  f: F,
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
  F: Fn(StepContext, serde_json::Value) -> Fut + Send + Sync,
  Fut: Future<Output = Result<serde_json::Value, StepFailure>> + Send,
{
  FnHandler { f }
}

#[async_trait]
impl<F, Fut> StepHandler for FnHandler<F>
where
  F: Fn(StepContext, serde_json::Value) -> Fut + Send + Sync,
  Fut: Future<Output = Result<serde_json::Value, StepFailure>> + Send,
{
  async fn execute(
    &self,
    ctx: StepContext,
    inputs: serde_json::Value,
  ) -> Result<serde_json::Value, StepFailure> {
    (self.f)(ctx, inputs).await
  }
}

/// Handler ids mapped to implementations.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
  handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl HandlerRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a handler under `id`.
  pub fn register(
    &mut self,
    id: impl Into<String>,
    handler: impl StepHandler + 'static,
  ) -> Result<&mut Self, FlowError> {
    self.register_arc(id, Arc::new(handler))
  }

  pub fn register_arc(
    &mut self,
    id: impl Into<String>,
    handler: Arc<dyn StepHandler>,
  ) -> Result<&mut Self, FlowError> {
    let id = id.into();
    if self.handlers.contains_key(&id) {
      return Err(FlowError::DuplicateHandler(id));
    }
    self.handlers.insert(id, handler);
    Ok(self)
  }

  pub fn get(&self, id: &str) -> Option<Arc<dyn StepHandler>> {
    self.handlers.get(id).cloned()
  }

  pub fn contains(&self, id: &str) -> bool {
    self.handlers.contains_key(id)
  }

  pub fn ids(&self) -> impl Iterator<Item = &str> {
    self.handlers.keys().map(String::as_str)
  }
}

impl fmt::Debug for HandlerRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut ids: Vec<&str> = self.ids().collect();
    ids.sort_unstable();
    f.debug_struct("HandlerRegistry").field("handlers", &ids).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[tokio::test]
  async fn test_fn_handler_executes() {
    let handler = handler_fn(|ctx: StepContext, inputs: serde_json::Value| async move {
      Ok(json!({"step": ctx.step_name, "echo": inputs}))
    });

    let ctx = StepContext::new("t1", "outline");
    let output = handler.execute(ctx, json!({"topic": "tides"})).await.unwrap();
    assert_eq!(output, json!({"step": "outline", "echo": {"topic": "tides"}}));
  }

  #[tokio::test]
  async fn test_checkpoint_observes_cancellation() {
    let cancel = CancellationToken::new();
    let ctx = StepContext::new("t1", "outline").with_cancel(cancel.clone());
    assert!(ctx.checkpoint().is_ok());
    cancel.cancel();
    assert_eq!(ctx.checkpoint(), Err(StepFailure::Cancelled));
  }

  #[test]
  fn test_duplicate_handler_rejected() {
    let mut registry = HandlerRegistry::new();
    let echo = || handler_fn(|_ctx: StepContext, inputs: serde_json::Value| async move { Ok(inputs) });
    registry.register("echo", echo()).unwrap();
    assert!(matches!(
      registry.register("echo", echo()),
      Err(FlowError::DuplicateHandler(_))
    ));
    assert!(registry.contains("echo"));
    assert!(registry.get("missing").is_none());
  }
}
