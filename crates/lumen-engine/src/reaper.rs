//! Lease reaper.
//!
//! A claimed task holds an implicit lease of `lease_ms` from `started_at`.
//! When a lease runs out the worker is presumed dead: the task goes back to
//! `pending` with one more retry counted, or fails once its budget is spent.
//! Each pass then replays flow run progress that was recorded but not applied.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lumen_store::{FailureKind, Store};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::EngineError;
use crate::tracker::Tracker;

pub const LEASE_EXPIRED: &str = "lease expired";

/// What one reaper pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
  pub requeued: usize,
  pub failed: usize,
  /// Flow runs brought back in line with their recorded state.
  pub recovered: usize,
}

pub struct Reaper {
  tracker: Arc<Tracker>,
  lease: Duration,
  interval: Duration,
}

impl Reaper {
  pub fn new(tracker: Arc<Tracker>, lease: Duration, interval: Duration) -> Self {
    Self {
      tracker,
      lease,
      interval,
    }
  }

  fn store(&self) -> &Arc<dyn Store> {
    self.tracker.store()
  }

  /// Requeue or fail every task whose lease ran out as of `now`.
  ///
  /// Backoff for requeued tasks is measured from the wall clock.
  pub async fn reap_once(&self, now: DateTime<Utc>) -> Result<ReapReport, EngineError> {
    let lease = chrono::Duration::from_std(self.lease).unwrap_or(chrono::Duration::MAX);
    let cutoff = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);
    let expired = self.store().list_expired_tasks(cutoff).await?;
    let mut report = ReapReport::default();

    for task in expired {
      // A running task always has an owner; the conditional writes below
      // refuse anything else.
      let worker_id = task.worker_id.clone().unwrap_or_default();

      if task.has_retry_budget() {
        let failures = u32::try_from(task.retry_count).unwrap_or(0);
        let available_at = self
          .tracker
          .retry_policy()
          .next_available_at(Utc::now(), failures);
        match self
          .store()
          .requeue_task(&task.task_id, &worker_id, LEASE_EXPIRED, available_at)
          .await
        {
          Ok(requeued) => {
            warn!(
              task_id = %requeued.task_id,
              %worker_id,
              retry_count = requeued.retry_count,
              "lease expired, task requeued"
            );
            self.tracker.on_task_requeued(&requeued).await?;
            self.tracker.dispatcher().wake(&requeued).await;
            report.requeued += 1;
          }
          // The worker finished just in time.
          Err(e) if e.is_conflict() => {}
          Err(e) => return Err(e.into()),
        }
      } else {
        match self
          .store()
          .fail_task(&task.task_id, &worker_id, LEASE_EXPIRED, FailureKind::Transient)
          .await
        {
          Ok(_) => {
            warn!(task_id = %task.task_id, %worker_id, "lease expired, retries exhausted");
            self.tracker.on_task_outcome(&task.task_id).await?;
            report.failed += 1;
          }
          Err(e) if e.is_conflict() => {}
          Err(e) => return Err(e.into()),
        }
      }
    }

    // Outcomes recorded on tasks but never applied to their runs, such as
    // after a store error in the worker, would otherwise stall the run.
    report.recovered = self.tracker.recover_stalled(cutoff).await?;

    if report != ReapReport::default() {
      info!(
        requeued = report.requeued,
        failed = report.failed,
        recovered = report.recovered,
        "reaper pass finished"
      );
    }
    Ok(report)
  }

  /// Reap every `interval` until `shutdown` is cancelled.
  pub async fn run(&self, shutdown: CancellationToken) {
    info!(lease_ms = self.lease.as_millis() as u64, "starting lease reaper");
    let mut interval = tokio::time::interval(self.interval.max(Duration::from_millis(1)));
    loop {
      tokio::select! {
        _ = shutdown.cancelled() => break,
        _ = interval.tick() => {
          if let Err(e) = self.reap_once(Utc::now()).await {
            error!(error = %e, "reaper pass failed");
          }
        }
      }
    }
    info!("lease reaper stopped");
  }
}
