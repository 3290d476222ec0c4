//! Flow events and notifiers.
//!
//! The tracker emits events as runs progress. `RunFinished` is how the owner
//! of a run (for example a content unit) learns its terminal status and the
//! id of the run that produced it.

use lumen_store::FlowRunStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Events emitted during flow execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FlowEvent {
  RunStarted {
    flow_run_id: String,
    flow_name: String,
    owner_id: Option<String>,
  },

  /// A worker began executing a step attempt.
  StepStarted {
    flow_run_id: String,
    step: String,
    attempt: i32,
    task_id: String,
  },

  StepCompleted {
    flow_run_id: String,
    step: String,
    attempt: i32,
  },

  StepFailed {
    flow_run_id: String,
    step: String,
    attempt: i32,
    error: String,
  },

  /// A new attempt was scheduled for a failed step.
  StepRetried {
    flow_run_id: String,
    step: String,
    attempt: i32,
    task_id: String,
  },

  RunFinished {
    flow_run_id: String,
    owner_id: Option<String>,
    status: FlowRunStatus,
    error: Option<String>,
  },
}

impl FlowEvent {
  pub fn flow_run_id(&self) -> &str {
    match self {
      Self::RunStarted { flow_run_id, .. }
      | Self::StepStarted { flow_run_id, .. }
      | Self::StepCompleted { flow_run_id, .. }
      | Self::StepFailed { flow_run_id, .. }
      | Self::StepRetried { flow_run_id, .. }
      | Self::RunFinished { flow_run_id, .. } => flow_run_id,
    }
  }
}

/// Receives flow events.
///
/// Called inline by the tracker, so implementations should hand work off
/// rather than block.
pub trait FlowNotifier: Send + Sync {
  fn notify(&self, event: FlowEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl FlowNotifier for NoopNotifier {
  fn notify(&self, _event: FlowEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<FlowEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<FlowEvent>) -> Self {
    Self { sender }
  }
}

impl FlowNotifier for ChannelNotifier {
  fn notify(&self, event: FlowEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}

/// Writes events to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

impl FlowNotifier for LogNotifier {
  fn notify(&self, event: FlowEvent) {
    match &event {
      FlowEvent::RunFinished {
        flow_run_id,
        owner_id,
        status,
        error,
      } => match status {
        FlowRunStatus::Completed => {
          info!(%flow_run_id, owner_id = ?owner_id, "flow run completed");
        }
        _ => warn!(
          %flow_run_id,
          owner_id = ?owner_id,
          status = status.as_str(),
          error = error.as_deref().unwrap_or(""),
          "flow run did not complete"
        ),
      },
      FlowEvent::StepFailed {
        flow_run_id,
        step,
        attempt,
        error,
      } => {
        warn!(%flow_run_id, %step, attempt, %error, "step failed");
      }
      other => {
        info!(flow_run_id = other.flow_run_id(), event = ?other, "flow event");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_channel_notifier_delivers() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let notifier = ChannelNotifier::new(tx);
    notifier.notify(FlowEvent::StepCompleted {
      flow_run_id: "r1".to_string(),
      step: "outline".to_string(),
      attempt: 0,
    });

    let event = rx.try_recv().unwrap();
    assert_eq!(event.flow_run_id(), "r1");
  }

  #[test]
  fn test_channel_notifier_ignores_dropped_receiver() {
    let (tx, rx) = mpsc::unbounded_channel();
    drop(rx);
    ChannelNotifier::new(tx).notify(FlowEvent::RunStarted {
      flow_run_id: "r1".to_string(),
      flow_name: "unit_content".to_string(),
      owner_id: None,
    });
  }
}
