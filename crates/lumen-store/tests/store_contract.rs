//! Behavior every `Store` implementation must share, run against both the
//! in-memory and the SQLite store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use lumen_store::{
  Error, FailureKind, FlowRun, FlowRunFilter, FlowRunStatus, FlowStepRun, MemoryStore, SqliteStore,
  StepRunStatus, Store, Task, TaskFilter, TaskStatus,
};
use serde_json::json;

async fn sqlite_file() -> (Arc<dyn Store>, tempfile::TempDir) {
  let dir = tempfile::tempdir().expect("failed to create temp dir");
  let store = SqliteStore::connect(dir.path().join("lumen.db"))
    .await
    .expect("failed to open sqlite store");
  store.migrate().await.expect("failed to migrate");
  (Arc::new(store), dir)
}

async fn sqlite_memory() -> Arc<dyn Store> {
  let store = SqliteStore::in_memory()
    .await
    .expect("failed to open sqlite store");
  store.migrate().await.expect("failed to migrate");
  Arc::new(store)
}

fn memory() -> Arc<dyn Store> {
  Arc::new(MemoryStore::new())
}

/// Run a contract check against every store implementation.
macro_rules! contract {
  ($name:ident, $check:ident) => {
    mod $name {
      use super::*;

      #[tokio::test]
      async fn memory_store() {
        $check(memory()).await;
      }

      #[tokio::test]
      async fn sqlite_store() {
        $check(sqlite_memory().await).await;
      }
    }
  };
}

async fn rejects_invalid_tasks(store: Arc<dyn Store>) {
  let task = Task::new("outline", "llm", json!({})).with_max_retries(-1);
  assert!(matches!(
    store.create_task(&task).await,
    Err(Error::InvalidTask(_))
  ));

  let task = Task::from_inputs("outline", "llm", &vec![1, 2, 3]).unwrap();
  store.create_task(&task).await.unwrap();
  assert_eq!(store.get_task(&task.task_id).await.unwrap().inputs.0, json!([1, 2, 3]));
}
contract!(invalid_tasks, rejects_invalid_tasks);

async fn claims_by_priority_then_age(store: Arc<dyn Store>) {
  let now = Utc::now();
  let low = Task::new("low", "llm", json!({}));
  let high_old = Task::new("high-old", "llm", json!({})).with_priority(10);
  let mut high_new = Task::new("high-new", "llm", json!({})).with_priority(10);
  high_new.created_at = high_old.created_at + Duration::milliseconds(5);
  let other_queue = Task::new("other", "llm", json!({})).with_queue("background");

  for task in [&low, &high_new, &high_old, &other_queue] {
    store.create_task(task).await.unwrap();
  }

  let later = now + Duration::seconds(1);
  let first = store.claim_task("default", "w1", later).await.unwrap().unwrap();
  let second = store.claim_task("default", "w1", later).await.unwrap().unwrap();
  let third = store.claim_task("default", "w1", later).await.unwrap().unwrap();
  assert_eq!(first.task_id, high_old.task_id);
  assert_eq!(second.task_id, high_new.task_id);
  assert_eq!(third.task_id, low.task_id);
  assert!(store.claim_task("default", "w1", later).await.unwrap().is_none());

  assert_eq!(first.status, TaskStatus::Running);
  assert_eq!(first.worker_id.as_deref(), Some("w1"));
  assert!(first.started_at.is_some());

  let background = store.claim_task("background", "w2", later).await.unwrap().unwrap();
  assert_eq!(background.task_id, other_queue.task_id);
}
contract!(claim_order, claims_by_priority_then_age);

async fn delayed_tasks_wait(store: Arc<dyn Store>) {
  let now = Utc::now();
  let task = Task::new("retry", "llm", json!({})).available_at(now + Duration::seconds(30));
  store.create_task(&task).await.unwrap();

  assert!(store.claim_task("default", "w1", now).await.unwrap().is_none());
  let claimed = store
    .claim_task("default", "w1", now + Duration::seconds(31))
    .await
    .unwrap();
  assert_eq!(claimed.map(|t| t.task_id), Some(task.task_id));
}
contract!(delayed, delayed_tasks_wait);

async fn terminal_writes_are_idempotent(store: Arc<dyn Store>) {
  let task = Task::new("outline", "llm", json!({"topic": "tides"}));
  store.create_task(&task).await.unwrap();

  // Finishing a task that was never claimed is refused.
  assert!(matches!(
    store.complete_task(&task.task_id, "w1", &json!({})).await,
    Err(Error::InvalidTransition { .. })
  ));

  store.claim_task("default", "w1", Utc::now()).await.unwrap().unwrap();

  // Only the claiming worker may finish it.
  assert!(store
    .complete_task(&task.task_id, "w2", &json!({}))
    .await
    .unwrap_err()
    .is_conflict());

  let result = json!({"outline": ["a", "b"]});
  let done = store.complete_task(&task.task_id, "w1", &result).await.unwrap();
  assert_eq!(done.status, TaskStatus::Completed);
  assert_eq!(done.progress_percentage, 100);
  assert!(done.completed_at.is_some());

  let again = store.complete_task(&task.task_id, "w1", &result).await.unwrap();
  assert_eq!(again.completed_at, done.completed_at);

  assert!(store
    .complete_task(&task.task_id, "w1", &json!({"other": true}))
    .await
    .unwrap_err()
    .is_conflict());
  assert!(store
    .fail_task(&task.task_id, "w1", "late failure", FailureKind::Transient)
    .await
    .unwrap_err()
    .is_conflict());
}
contract!(terminal_writes, terminal_writes_are_idempotent);

async fn failures_are_idempotent(store: Arc<dyn Store>) {
  let task = Task::new("outline", "llm", json!({}));
  store.create_task(&task).await.unwrap();
  store.claim_task("default", "w1", Utc::now()).await.unwrap().unwrap();

  let failed = store
    .fail_task(&task.task_id, "w1", "rate limited", FailureKind::Transient)
    .await
    .unwrap();
  assert_eq!(failed.status, TaskStatus::Failed);
  assert_eq!(failed.error_message.as_deref(), Some("rate limited"));
  assert_eq!(failed.failure_kind, Some(FailureKind::Transient));
  assert!(failed.completed_at.is_some());

  store
    .fail_task(&task.task_id, "w1", "rate limited", FailureKind::Transient)
    .await
    .unwrap();
  assert!(store
    .fail_task(&task.task_id, "w1", "rate limited", FailureKind::Permanent)
    .await
    .unwrap_err()
    .is_conflict());
  assert!(store
    .fail_task(&task.task_id, "w1", "different", FailureKind::Transient)
    .await
    .unwrap_err()
    .is_conflict());
}
contract!(failures, failures_are_idempotent);

async fn requeue_spends_retry_budget(store: Arc<dyn Store>) {
  let now = Utc::now();
  let task = Task::new("outline", "llm", json!({})).with_max_retries(1);
  store.create_task(&task).await.unwrap();
  store.claim_task("default", "w1", now).await.unwrap().unwrap();

  // A stale worker cannot requeue someone else's claim.
  assert!(store
    .requeue_task(&task.task_id, "w2", "lease expired", now)
    .await
    .unwrap_err()
    .is_conflict());

  let requeued = store
    .requeue_task(&task.task_id, "w1", "lease expired", now)
    .await
    .unwrap();
  assert_eq!(requeued.status, TaskStatus::Pending);
  assert_eq!(requeued.retry_count, 1);
  assert!(requeued.worker_id.is_none());
  assert!(requeued.started_at.is_none());

  let reclaimed = store.claim_task("default", "w2", now).await.unwrap().unwrap();
  assert_eq!(reclaimed.task_id, task.task_id);

  assert!(matches!(
    store.requeue_task(&task.task_id, "w2", "lease expired", now).await,
    Err(Error::InvalidTransition { .. })
  ));
}
contract!(requeue, requeue_spends_retry_budget);

async fn completion_clears_requeue_error(store: Arc<dyn Store>) {
  let now = Utc::now();
  let task = Task::new("outline", "llm", json!({})).with_max_retries(2);
  store.create_task(&task).await.unwrap();
  store.claim_task("default", "w1", now).await.unwrap().unwrap();

  let requeued = store
    .requeue_task(&task.task_id, "w1", "lease expired", now)
    .await
    .unwrap();
  assert_eq!(requeued.error_message.as_deref(), Some("lease expired"));

  store.claim_task("default", "w2", now).await.unwrap().unwrap();
  let done = store
    .complete_task(&task.task_id, "w2", &json!({"outline": []}))
    .await
    .unwrap();
  assert_eq!(done.status, TaskStatus::Completed);
  assert!(done.error_message.is_none());
  assert!(done.failure_kind.is_none());
  assert_eq!(done.retry_count, 1);
}
contract!(requeue_then_complete, completion_clears_requeue_error);

async fn cancel_pending_and_running(store: Arc<dyn Store>) {
  let pending = Task::new("pending", "llm", json!({}));
  store.create_task(&pending).await.unwrap();
  let cancelled = store.cancel_task(&pending.task_id, "run cancelled").await.unwrap();
  assert_eq!(cancelled.status, TaskStatus::Cancelled);
  assert!(store.claim_task("default", "w1", Utc::now()).await.unwrap().is_none());

  // Cancelling twice is a no-op.
  store.cancel_task(&pending.task_id, "run cancelled").await.unwrap();

  let done = Task::new("done", "llm", json!({}));
  store.create_task(&done).await.unwrap();
  store.claim_task("default", "w1", Utc::now()).await.unwrap().unwrap();
  store.complete_task(&done.task_id, "w1", &json!(1)).await.unwrap();
  assert!(store
    .cancel_task(&done.task_id, "too late")
    .await
    .unwrap_err()
    .is_conflict());
}
contract!(cancel, cancel_pending_and_running);

async fn progress_requires_claim(store: Arc<dyn Store>) {
  let task = Task::new("outline", "llm", json!({}));
  store.create_task(&task).await.unwrap();
  assert!(store
    .update_progress(&task.task_id, "w1", 10, None)
    .await
    .is_err());

  store.claim_task("default", "w1", Utc::now()).await.unwrap().unwrap();
  store
    .update_progress(&task.task_id, "w1", 40, Some("drafting lessons"))
    .await
    .unwrap();
  let stored = store.get_task(&task.task_id).await.unwrap();
  assert_eq!(stored.progress_percentage, 40);
  assert_eq!(stored.current_step.as_deref(), Some("drafting lessons"));

  assert!(matches!(
    store.update_progress(&task.task_id, "w1", 101, None).await,
    Err(Error::InvalidTask(_))
  ));
  assert!(store
    .update_progress(&task.task_id, "w2", 50, None)
    .await
    .unwrap_err()
    .is_conflict());
}
contract!(progress, progress_requires_claim);

async fn expired_tasks_are_listed(store: Arc<dyn Store>) {
  let now = Utc::now();
  let task = Task::new("outline", "llm", json!({}));
  store.create_task(&task).await.unwrap();
  store
    .claim_task("default", "w1", now - Duration::minutes(10))
    .await
    .unwrap()
    .unwrap();

  let expired = store
    .list_expired_tasks(now - Duration::minutes(5))
    .await
    .unwrap();
  assert_eq!(expired.len(), 1);
  assert!(store
    .list_expired_tasks(now - Duration::minutes(15))
    .await
    .unwrap()
    .is_empty());
}
contract!(expired, expired_tasks_are_listed);

async fn audit_queries_filter(store: Arc<dyn Store>) {
  let a = Task::new("a", "llm", json!({})).with_owner("unit-1");
  let b = Task::new("b", "image", json!({}))
    .with_owner("unit-2")
    .with_queue("background");
  store.create_task(&a).await.unwrap();
  store.create_task(&b).await.unwrap();

  let by_owner = store
    .list_tasks(&TaskFilter {
      owner_id: Some("unit-1".to_string()),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(by_owner.len(), 1);
  assert_eq!(by_owner[0].task_id, a.task_id);

  let by_type = store
    .list_tasks(&TaskFilter {
      task_type: Some("image".to_string()),
      queue_name: Some("background".to_string()),
      status: Some(TaskStatus::Pending),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(by_type.len(), 1);
  assert_eq!(by_type[0].task_id, b.task_id);

  assert_eq!(store.list_tasks(&TaskFilter::default()).await.unwrap().len(), 2);
}
contract!(audit, audit_queries_filter);

async fn payloads_round_trip(store: Arc<dyn Store>) {
  let inputs = json!({
    "topic": "photosynthesis",
    "grade": 7,
    "ratio": 0.25,
    "tags": ["biology", "plants"],
    "extra": {"nested": [true, null]}
  });
  let task = Task::new("outline", "llm", inputs.clone());
  store.create_task(&task).await.unwrap();
  store.claim_task("default", "w1", Utc::now()).await.unwrap().unwrap();
  let result = json!({"lessons": [{"title": "Light"}, {"title": "Chlorophyll"}]});
  store.complete_task(&task.task_id, "w1", &result).await.unwrap();

  let stored = store.get_task(&task.task_id).await.unwrap();
  assert_eq!(
    serde_json::to_vec(&stored.inputs.0).unwrap(),
    serde_json::to_vec(&inputs).unwrap()
  );
  assert_eq!(
    serde_json::to_vec(&stored.result.unwrap().0).unwrap(),
    serde_json::to_vec(&result).unwrap()
  );
}
contract!(payloads, payloads_round_trip);

async fn floats_survive_storage(store: Arc<dyn Store>) {
  let inputs = json!({"weights": [0.1, 1e-300, 2.5e17, -0.0000123456789012345]});
  let task = Task::new("score", "llm", inputs.clone());
  store.create_task(&task).await.unwrap();
  store.claim_task("default", "w1", Utc::now()).await.unwrap().unwrap();

  let result = json!({"score": 0.00011282263937946357, "confidence": 0.7310585786300049});
  store.complete_task(&task.task_id, "w1", &result).await.unwrap();

  let stored = store.get_task(&task.task_id).await.unwrap();
  assert_eq!(stored.inputs.0, inputs);
  assert_eq!(stored.result.as_ref().map(|r| &r.0), Some(&result));

  // A replay of the same result is recognised as already recorded.
  let again = store.complete_task(&task.task_id, "w1", &result).await.unwrap();
  assert_eq!(again.completed_at, stored.completed_at);
}
contract!(floats, floats_survive_storage);

async fn step_runs_form_a_chain(store: Arc<dyn Store>) {
  let run = FlowRun::new("unit_content", json!({"unit": "u1"})).with_owner(Some("u1".into()));
  store.create_flow_run(&run).await.unwrap();

  let mut first = FlowStepRun::first_attempt(&run.flow_run_id, 0, "outline", "t1", json!({}));
  store.create_step_run(&first).await.unwrap();

  let duplicate = FlowStepRun::first_attempt(&run.flow_run_id, 0, "outline", "t9", json!({}));
  assert!(matches!(
    store.create_step_run(&duplicate).await,
    Err(Error::InvalidStepRun(_))
  ));

  let retry = FlowStepRun::retry_of(&first, "t2");
  assert!(store.create_step_run(&retry).await.is_err());

  first.status = StepRunStatus::Failed;
  first.error = Some("timeout".to_string());
  first.completed_at = Some(Utc::now());
  store.update_step_run(&first).await.unwrap();
  store.create_step_run(&retry).await.unwrap();

  let by_task = store.get_step_run_by_task("t2").await.unwrap();
  assert_eq!(by_task.step_run_id, retry.step_run_id);
  assert_eq!(by_task.retry_attempt, 1);

  let runs = store.list_step_runs(&run.flow_run_id).await.unwrap();
  let attempts: Vec<i32> = runs.iter().map(|s| s.retry_attempt).collect();
  assert_eq!(attempts, vec![0, 1]);
  assert_eq!(runs[0].status, StepRunStatus::Failed);
}
contract!(step_chain, step_runs_form_a_chain);

async fn flow_runs_finish_once(store: Arc<dyn Store>) {
  let run = FlowRun::new("unit_content", json!({})).with_owner(Some("u1".into()));
  store.create_flow_run(&run).await.unwrap();

  store.advance_flow_run(&run.flow_run_id, 0, "t1").await.unwrap();
  let running = store.get_flow_run(&run.flow_run_id).await.unwrap();
  assert_eq!(running.status, FlowRunStatus::Running);
  assert_eq!(running.current_task_id.as_deref(), Some("t1"));

  assert!(store
    .finish_flow_run(&run.flow_run_id, FlowRunStatus::Partial, Some("step 2 failed"))
    .await
    .unwrap());
  assert!(!store
    .finish_flow_run(&run.flow_run_id, FlowRunStatus::Completed, None)
    .await
    .unwrap());

  let finished = store.get_flow_run(&run.flow_run_id).await.unwrap();
  assert_eq!(finished.status, FlowRunStatus::Partial);
  assert_eq!(finished.error.as_deref(), Some("step 2 failed"));
  assert!(finished.completed_at.is_some());
  assert!(store.advance_flow_run(&run.flow_run_id, 1, "t2").await.is_err());

  let by_owner = store
    .list_flow_runs(&FlowRunFilter {
      owner_id: Some("u1".to_string()),
      ..Default::default()
    })
    .await
    .unwrap();
  assert_eq!(by_owner.len(), 1);
}
contract!(flow_runs, flow_runs_finish_once);

async fn deleting_a_run_cascades_to_step_runs(store: Arc<dyn Store>) {
  let run = FlowRun::new("unit_content", json!({}));
  store.create_flow_run(&run).await.unwrap();
  let task = Task::new("outline", "llm", json!({})).with_flow_run(&run.flow_run_id);
  store.create_task(&task).await.unwrap();
  let step = FlowStepRun::first_attempt(&run.flow_run_id, 0, "outline", &task.task_id, json!({}));
  store.create_step_run(&step).await.unwrap();

  store.delete_flow_run(&run.flow_run_id).await.unwrap();
  assert!(store.get_step_run(&step.step_run_id).await.unwrap_err().is_not_found());
  assert!(store.list_step_runs(&run.flow_run_id).await.unwrap().is_empty());
  // Tasks stay as an audit trail.
  assert!(store.get_task(&task.task_id).await.is_ok());
}
contract!(cascade, deleting_a_run_cascades_to_step_runs);

async fn concurrent_claims_hand_out_one_task(store: Arc<dyn Store>) {
  let task = Task::new("outline", "llm", json!({}));
  store.create_task(&task).await.unwrap();

  let mut handles = Vec::new();
  for i in 0..16 {
    let store = store.clone();
    handles.push(tokio::spawn(async move {
      store
        .claim_task("default", &format!("w{}", i), Utc::now())
        .await
        .unwrap()
    }));
  }

  let mut winners = 0;
  for handle in handles {
    if handle.await.unwrap().is_some() {
      winners += 1;
    }
  }
  assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_memory_store_single_claim_under_contention() {
  concurrent_claims_hand_out_one_task(memory()).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_sqlite_store_single_claim_under_contention() {
  let (store, _dir) = sqlite_file().await;
  concurrent_claims_hand_out_one_task(store).await;
}
