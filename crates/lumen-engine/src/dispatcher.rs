//! Makes tasks visible to workers.

use std::sync::Arc;

use lumen_store::{Store, Task};
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::transport::QueueTransport;

/// Persists tasks and wakes workers serving their queue.
///
/// Priority ordering within a queue is enforced by the store's claim; the
/// transport only carries wake-ups.
#[derive(Clone)]
pub struct Dispatcher {
  store: Arc<dyn Store>,
  transport: Arc<dyn QueueTransport>,
}

impl Dispatcher {
  pub fn new(store: Arc<dyn Store>, transport: Arc<dyn QueueTransport>) -> Self {
    Self { store, transport }
  }

  pub fn store(&self) -> &Arc<dyn Store> {
    &self.store
  }

  /// Store a new pending task and wake a worker for it.
  pub async fn enqueue(&self, task: &Task) -> Result<(), EngineError> {
    self.create(task).await?;
    self.wake(task).await;
    Ok(())
  }

  /// Store a new pending task without waking anyone yet.
  pub async fn create(&self, task: &Task) -> Result<(), EngineError> {
    self.store.create_task(task).await?;
    debug!(
      task_id = %task.task_id,
      queue = %task.queue_name,
      priority = task.priority,
      "task enqueued"
    );
    Ok(())
  }

  /// Announce a pending task on its queue.
  ///
  /// Failures are logged only: polling workers still find the task.
  pub async fn wake(&self, task: &Task) {
    if let Err(e) = self.transport.push(&task.queue_name, &task.task_id).await {
      warn!(task_id = %task.task_id, queue = %task.queue_name, error = %e, "failed to push task id");
    }
  }
}
