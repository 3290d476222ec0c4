//! Queue transport for cross-worker hand-off of task ids.
//!
//! Ids pushed here only wake idle workers. The store's atomic claim decides
//! who runs what, so a lost, duplicated or stale id is harmless.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::EngineError;

#[async_trait]
pub trait QueueTransport: Send + Sync {
  /// Announce that `task_id` is claimable on `queue`.
  async fn push(&self, queue: &str, task_id: &str) -> Result<(), EngineError>;

  /// Wait up to `timeout` for an id on `queue`.
  async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, EngineError>;
}

/// Ids kept per queue by default before the oldest are dropped.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// In-process transport backed by one bounded deque per queue.
///
/// Ids pushed to a queue nobody pops from, or faster than they are popped,
/// are dropped oldest first once `capacity` is reached.
#[derive(Debug)]
pub struct MemoryTransport {
  queues: Mutex<HashMap<String, VecDeque<String>>>,
  notify: Notify,
  capacity: usize,
}

impl Default for MemoryTransport {
  fn default() -> Self {
    Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
  }
}

impl MemoryTransport {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      queues: Mutex::new(HashMap::new()),
      notify: Notify::new(),
      capacity: capacity.max(1),
    }
  }

  fn try_pop(&self, queue: &str) -> Result<Option<String>, EngineError> {
    let mut queues = self.queues.lock().map_err(|_| poisoned())?;
    Ok(queues.get_mut(queue).and_then(VecDeque::pop_front))
  }

  /// Number of ids waiting on `queue`.
  pub fn len(&self, queue: &str) -> usize {
    self
      .queues
      .lock()
      .map(|queues| queues.get(queue).map_or(0, VecDeque::len))
      .unwrap_or(0)
  }
}

fn poisoned() -> EngineError {
  EngineError::Transport {
    message: "transport lock poisoned".to_string(),
  }
}

#[async_trait]
impl QueueTransport for MemoryTransport {
  async fn push(&self, queue: &str, task_id: &str) -> Result<(), EngineError> {
    {
      let mut queues = self.queues.lock().map_err(|_| poisoned())?;
      let pending = queues.entry(queue.to_string()).or_default();
      if pending.len() >= self.capacity {
        pending.pop_front();
      }
      pending.push_back(task_id.to_string());
    }
    self.notify.notify_waiters();
    Ok(())
  }

  async fn pop(&self, queue: &str, timeout: Duration) -> Result<Option<String>, EngineError> {
    let deadline = Instant::now() + timeout;
    loop {
      // Register before checking so a push in between is not missed.
      let notified = self.notify.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if let Some(task_id) = self.try_pop(queue)? {
        return Ok(Some(task_id));
      }
      if tokio::time::timeout_at(deadline, notified).await.is_err() {
        return Ok(None);
      }
    }
  }
}
