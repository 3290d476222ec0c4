use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::types::Json;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::debug;

use crate::transition::{
  Outcome, check_cancel, check_complete, check_fail, check_progress, check_requeue,
  validate_new_step_run, validate_new_task,
};
use crate::{
  Error, FailureKind, FlowRun, FlowRunFilter, FlowRunStatus, FlowStepRun, Store, Task, TaskFilter,
};

macro_rules! select_tasks {
  ($rest:literal) => {
    concat!(
      "SELECT task_id, task_name, status, queue_name, task_type, inputs, result, error_message, ",
      "failure_kind, created_at, available_at, started_at, completed_at, progress_percentage, current_step, ",
      "retry_count, max_retries, priority, worker_id, flow_run_id, owner_id FROM tasks ",
      $rest
    )
  };
}

macro_rules! select_flow_runs {
  ($rest:literal) => {
    concat!(
      "SELECT flow_run_id, flow_name, inputs, current_step, status, current_task_id, owner_id, ",
      "error, cancel_requested, created_at, completed_at FROM flow_runs ",
      $rest
    )
  };
}

macro_rules! select_step_runs {
  ($rest:literal) => {
    concat!(
      "SELECT step_run_id, flow_run_id, step_index, step_name, retry_attempt, ",
      "retry_of_step_run_id, task_id, status, inputs, output, error, created_at, started_at, ",
      "completed_at FROM flow_step_runs ",
      $rest
    )
  };
}

/// SQLite-based store implementation.
pub struct SqliteStore {
  pool: SqlitePool,
}

impl SqliteStore {
  /// Create a new SQLite store with the given connection pool.
  pub fn new(pool: SqlitePool) -> Self {
    Self { pool }
  }

  /// Open (or create) a database file with WAL journaling and a busy timeout
  /// so concurrent writers wait instead of failing.
  pub async fn connect(path: impl AsRef<Path>) -> Result<Self, Error> {
    let options = SqliteConnectOptions::new()
      .filename(path)
      .create_if_missing(true)
      .journal_mode(SqliteJournalMode::Wal)
      .busy_timeout(Duration::from_secs(30))
      .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(8)
      .connect_with(options)
      .await?;
    Ok(Self::new(pool))
  }

  /// Open a private in-memory database on a single connection.
  pub async fn in_memory() -> Result<Self, Error> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .idle_timeout(None)
      .max_lifetime(None)
      .connect_with(options)
      .await?;
    Ok(Self::new(pool))
  }

  /// Run database migrations.
  pub async fn migrate(&self) -> Result<(), Error> {
    sqlx::migrate!("./migrations").run(&self.pool).await?;
    Ok(())
  }

  pub fn pool(&self) -> &SqlitePool {
    &self.pool
  }

  async fn fetch_task(&self, task_id: &str) -> Result<Task, Error> {
    sqlx::query_as(select_tasks!("WHERE task_id = ?"))
      .bind(task_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| Error::NotFound(format!("task {}", task_id)))
  }

  /// Resolve a conditional write that matched no row.
  ///
  /// A repeat of the recorded outcome is returned as-is; anything else is an error.
  async fn settle_miss(
    &self,
    task_id: &str,
    check: impl FnOnce(&Task) -> Result<Outcome, Error>,
  ) -> Result<Task, Error> {
    let task = self.fetch_task(task_id).await?;
    match check(&task)? {
      Outcome::AlreadyRecorded => Ok(task),
      Outcome::Apply => Err(Error::Conflict {
        id: task_id.to_string(),
        message: "modified concurrently".to_string(),
      }),
    }
  }
}

fn map_unique_violation(err: sqlx::Error, message: impl FnOnce() -> String) -> Error {
  match &err {
    sqlx::Error::Database(db) if db.is_unique_violation() => Error::InvalidStepRun(message()),
    _ => Error::Database(err),
  }
}

#[async_trait]
impl Store for SqliteStore {
  async fn create_task(&self, task: &Task) -> Result<(), Error> {
    validate_new_task(task)?;
    sqlx::query(
      r#"
            INSERT INTO tasks (task_id, task_name, status, queue_name, task_type, inputs, result,
              error_message, failure_kind, created_at, available_at, started_at, completed_at,
              progress_percentage, current_step, retry_count, max_retries, priority, worker_id,
              flow_run_id, owner_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&task.task_id)
    .bind(&task.task_name)
    .bind(task.status)
    .bind(&task.queue_name)
    .bind(&task.task_type)
    .bind(&task.inputs)
    .bind(&task.result)
    .bind(&task.error_message)
    .bind(task.failure_kind)
    .bind(task.created_at)
    .bind(task.available_at)
    .bind(task.started_at)
    .bind(task.completed_at)
    .bind(task.progress_percentage)
    .bind(&task.current_step)
    .bind(task.retry_count)
    .bind(task.max_retries)
    .bind(task.priority)
    .bind(&task.worker_id)
    .bind(&task.flow_run_id)
    .bind(&task.owner_id)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_task(&self, task_id: &str) -> Result<Task, Error> {
    self.fetch_task(task_id).await
  }

  async fn claim_task(
    &self,
    queue_name: &str,
    worker_id: &str,
    now: DateTime<Utc>,
  ) -> Result<Option<Task>, Error> {
    // One statement: the inner select and the status guard run under the
    // same write lock, so a task can only flip to running once.
    let claimed: Option<Task> = sqlx::query_as(
      r#"
            UPDATE tasks
            SET status = 'running', worker_id = ?, started_at = ?
            WHERE task_id = (
              SELECT task_id FROM tasks
              WHERE queue_name = ? AND status = 'pending' AND available_at <= ?
              ORDER BY priority DESC, created_at ASC, rowid ASC
              LIMIT 1
            ) AND status = 'pending'
            RETURNING task_id, task_name, status, queue_name, task_type, inputs, result,
              error_message, failure_kind, created_at, available_at, started_at, completed_at,
              progress_percentage, current_step, retry_count, max_retries, priority, worker_id,
              flow_run_id, owner_id
            "#,
    )
    .bind(worker_id)
    .bind(now)
    .bind(queue_name)
    .bind(now)
    .fetch_optional(&self.pool)
    .await?;

    if let Some(task) = &claimed {
      debug!(task_id = %task.task_id, queue = queue_name, worker_id, "claimed task");
    }
    Ok(claimed)
  }

  async fn complete_task(
    &self,
    task_id: &str,
    worker_id: &str,
    result: &serde_json::Value,
  ) -> Result<Task, Error> {
    let updated = sqlx::query(
      r#"
            UPDATE tasks
            SET status = 'completed', result = ?, progress_percentage = 100, completed_at = ?,
                error_message = NULL, failure_kind = NULL
            WHERE task_id = ? AND status = 'running' AND worker_id = ?
            "#,
    )
    .bind(Json(result))
    .bind(Utc::now())
    .bind(task_id)
    .bind(worker_id)
    .execute(&self.pool)
    .await?;

    if updated.rows_affected() == 0 {
      return self
        .settle_miss(task_id, |t| check_complete(t, worker_id, result))
        .await;
    }
    self.fetch_task(task_id).await
  }

  async fn fail_task(
    &self,
    task_id: &str,
    worker_id: &str,
    error: &str,
    kind: FailureKind,
  ) -> Result<Task, Error> {
    let updated = sqlx::query(
      r#"
            UPDATE tasks
            SET status = 'failed', error_message = ?, failure_kind = ?, completed_at = ?
            WHERE task_id = ? AND status = 'running' AND worker_id = ?
            "#,
    )
    .bind(error)
    .bind(kind)
    .bind(Utc::now())
    .bind(task_id)
    .bind(worker_id)
    .execute(&self.pool)
    .await?;

    if updated.rows_affected() == 0 {
      return self
        .settle_miss(task_id, |t| check_fail(t, worker_id, error, kind))
        .await;
    }
    self.fetch_task(task_id).await
  }

  async fn cancel_task(&self, task_id: &str, reason: &str) -> Result<Task, Error> {
    let updated = sqlx::query(
      r#"
            UPDATE tasks
            SET status = 'cancelled', error_message = ?, completed_at = ?
            WHERE task_id = ? AND status IN ('pending', 'running')
            "#,
    )
    .bind(reason)
    .bind(Utc::now())
    .bind(task_id)
    .execute(&self.pool)
    .await?;

    if updated.rows_affected() == 0 {
      return self.settle_miss(task_id, check_cancel).await;
    }
    self.fetch_task(task_id).await
  }

  async fn requeue_task(
    &self,
    task_id: &str,
    worker_id: &str,
    error: &str,
    available_at: DateTime<Utc>,
  ) -> Result<Task, Error> {
    let updated = sqlx::query(
      r#"
            UPDATE tasks
            SET status = 'pending', retry_count = retry_count + 1, error_message = ?,
              worker_id = NULL, started_at = NULL, progress_percentage = 0, current_step = NULL,
              available_at = ?
            WHERE task_id = ? AND status = 'running' AND worker_id = ?
              AND retry_count < max_retries
            "#,
    )
    .bind(error)
    .bind(available_at)
    .bind(task_id)
    .bind(worker_id)
    .execute(&self.pool)
    .await?;

    if updated.rows_affected() == 0 {
      return self
        .settle_miss(task_id, |t| check_requeue(t, worker_id))
        .await;
    }
    self.fetch_task(task_id).await
  }

  async fn update_progress(
    &self,
    task_id: &str,
    worker_id: &str,
    percentage: i32,
    current_step: Option<&str>,
  ) -> Result<(), Error> {
    if !(0..=100).contains(&percentage) {
      return Err(Error::InvalidTask(format!(
        "{}: progress {} outside 0..=100",
        task_id, percentage
      )));
    }
    let updated = sqlx::query(
      r#"
            UPDATE tasks
            SET progress_percentage = ?, current_step = ?
            WHERE task_id = ? AND status = 'running' AND worker_id = ?
            "#,
    )
    .bind(percentage)
    .bind(current_step)
    .bind(task_id)
    .bind(worker_id)
    .execute(&self.pool)
    .await?;

    if updated.rows_affected() == 0 {
      let task = self.fetch_task(task_id).await?;
      check_progress(&task, worker_id, percentage)?;
      return Err(Error::Conflict {
        id: task_id.to_string(),
        message: "modified concurrently".to_string(),
      });
    }
    Ok(())
  }

  async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<Task>, Error> {
    let mut query = QueryBuilder::<Sqlite>::new(select_tasks!("WHERE 1 = 1"));
    if let Some(status) = filter.status {
      query.push(" AND status = ").push_bind(status);
    }
    if let Some(queue_name) = &filter.queue_name {
      query.push(" AND queue_name = ").push_bind(queue_name.clone());
    }
    if let Some(task_type) = &filter.task_type {
      query.push(" AND task_type = ").push_bind(task_type.clone());
    }
    if let Some(owner_id) = &filter.owner_id {
      query.push(" AND owner_id = ").push_bind(owner_id.clone());
    }
    if let Some(flow_run_id) = &filter.flow_run_id {
      query.push(" AND flow_run_id = ").push_bind(flow_run_id.clone());
    }
    query.push(" ORDER BY rowid ASC");

    Ok(query.build_query_as::<Task>().fetch_all(&self.pool).await?)
  }

  async fn list_expired_tasks(&self, started_before: DateTime<Utc>) -> Result<Vec<Task>, Error> {
    Ok(
      sqlx::query_as(select_tasks!(
        "WHERE status = 'running' AND started_at < ? ORDER BY started_at ASC"
      ))
      .bind(started_before)
      .fetch_all(&self.pool)
      .await?,
    )
  }

  async fn create_flow_run(&self, run: &FlowRun) -> Result<(), Error> {
    sqlx::query(
      r#"
            INSERT INTO flow_runs (flow_run_id, flow_name, inputs, current_step, status,
              current_task_id, owner_id, error, cancel_requested, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&run.flow_run_id)
    .bind(&run.flow_name)
    .bind(&run.inputs)
    .bind(run.current_step)
    .bind(run.status)
    .bind(&run.current_task_id)
    .bind(&run.owner_id)
    .bind(&run.error)
    .bind(run.cancel_requested)
    .bind(run.created_at)
    .bind(run.completed_at)
    .execute(&self.pool)
    .await?;

    Ok(())
  }

  async fn get_flow_run(&self, flow_run_id: &str) -> Result<FlowRun, Error> {
    sqlx::query_as(select_flow_runs!("WHERE flow_run_id = ?"))
      .bind(flow_run_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| Error::NotFound(format!("flow run {}", flow_run_id)))
  }

  async fn advance_flow_run(
    &self,
    flow_run_id: &str,
    current_step: i32,
    current_task_id: &str,
  ) -> Result<(), Error> {
    let updated = sqlx::query(
      r#"
            UPDATE flow_runs
            SET status = 'running', current_step = ?, current_task_id = ?
            WHERE flow_run_id = ? AND status IN ('pending', 'running')
            "#,
    )
    .bind(current_step)
    .bind(current_task_id)
    .bind(flow_run_id)
    .execute(&self.pool)
    .await?;

    if updated.rows_affected() == 0 {
      let run = self.get_flow_run(flow_run_id).await?;
      return Err(Error::InvalidTransition {
        id: flow_run_id.to_string(),
        message: format!("cannot advance, run is {}", run.status.as_str()),
      });
    }
    Ok(())
  }

  async fn finish_flow_run(
    &self,
    flow_run_id: &str,
    status: FlowRunStatus,
    error: Option<&str>,
  ) -> Result<bool, Error> {
    let updated = sqlx::query(
      r#"
            UPDATE flow_runs
            SET status = ?, error = ?, completed_at = ?
            WHERE flow_run_id = ? AND status IN ('pending', 'running')
            "#,
    )
    .bind(status)
    .bind(error)
    .bind(Utc::now())
    .bind(flow_run_id)
    .execute(&self.pool)
    .await?;

    if updated.rows_affected() == 0 {
      // Surface NotFound; an existing run was already terminal.
      self.get_flow_run(flow_run_id).await?;
      return Ok(false);
    }
    Ok(true)
  }

  async fn request_flow_run_cancel(&self, flow_run_id: &str) -> Result<FlowRun, Error> {
    sqlx::query(
      r#"
            UPDATE flow_runs
            SET cancel_requested = 1
            WHERE flow_run_id = ? AND status IN ('pending', 'running')
            "#,
    )
    .bind(flow_run_id)
    .execute(&self.pool)
    .await?;

    self.get_flow_run(flow_run_id).await
  }

  async fn list_flow_runs(&self, filter: &FlowRunFilter) -> Result<Vec<FlowRun>, Error> {
    let mut query = QueryBuilder::<Sqlite>::new(select_flow_runs!("WHERE 1 = 1"));
    if let Some(status) = filter.status {
      query.push(" AND status = ").push_bind(status);
    }
    if let Some(owner_id) = &filter.owner_id {
      query.push(" AND owner_id = ").push_bind(owner_id.clone());
    }
    if let Some(flow_name) = &filter.flow_name {
      query.push(" AND flow_name = ").push_bind(flow_name.clone());
    }
    query.push(" ORDER BY rowid ASC");

    Ok(query.build_query_as::<FlowRun>().fetch_all(&self.pool).await?)
  }

  async fn delete_flow_run(&self, flow_run_id: &str) -> Result<(), Error> {
    let deleted = sqlx::query("DELETE FROM flow_runs WHERE flow_run_id = ?")
      .bind(flow_run_id)
      .execute(&self.pool)
      .await?;

    if deleted.rows_affected() == 0 {
      return Err(Error::NotFound(format!("flow run {}", flow_run_id)));
    }
    Ok(())
  }

  async fn create_step_run(&self, step_run: &FlowStepRun) -> Result<(), Error> {
    self.get_flow_run(&step_run.flow_run_id).await?;

    let siblings: Vec<FlowStepRun> = sqlx::query_as(select_step_runs!(
      "WHERE flow_run_id = ? AND step_index = ? ORDER BY retry_attempt ASC"
    ))
    .bind(&step_run.flow_run_id)
    .bind(step_run.step_index)
    .fetch_all(&self.pool)
    .await?;
    validate_new_step_run(step_run, &siblings)?;

    sqlx::query(
      r#"
            INSERT INTO flow_step_runs (step_run_id, flow_run_id, step_index, step_name,
              retry_attempt, retry_of_step_run_id, task_id, status, inputs, output, error,
              created_at, started_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
    )
    .bind(&step_run.step_run_id)
    .bind(&step_run.flow_run_id)
    .bind(step_run.step_index)
    .bind(&step_run.step_name)
    .bind(step_run.retry_attempt)
    .bind(&step_run.retry_of_step_run_id)
    .bind(&step_run.task_id)
    .bind(step_run.status)
    .bind(&step_run.inputs)
    .bind(&step_run.output)
    .bind(&step_run.error)
    .bind(step_run.created_at)
    .bind(step_run.started_at)
    .bind(step_run.completed_at)
    .execute(&self.pool)
    .await
    .map_err(|e| {
      map_unique_violation(e, || {
        format!(
          "{} step {} attempt {} already exists",
          step_run.flow_run_id, step_run.step_index, step_run.retry_attempt
        )
      })
    })?;

    Ok(())
  }

  async fn get_step_run(&self, step_run_id: &str) -> Result<FlowStepRun, Error> {
    sqlx::query_as(select_step_runs!("WHERE step_run_id = ?"))
      .bind(step_run_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| Error::NotFound(format!("step run {}", step_run_id)))
  }

  async fn get_step_run_by_task(&self, task_id: &str) -> Result<FlowStepRun, Error> {
    sqlx::query_as(select_step_runs!("WHERE task_id = ?"))
      .bind(task_id)
      .fetch_optional(&self.pool)
      .await?
      .ok_or_else(|| Error::NotFound(format!("step run for task {}", task_id)))
  }

  async fn update_step_run(&self, step_run: &FlowStepRun) -> Result<(), Error> {
    let updated = sqlx::query(
      r#"
            UPDATE flow_step_runs
            SET status = ?, output = ?, error = ?, started_at = ?, completed_at = ?
            WHERE step_run_id = ?
            "#,
    )
    .bind(step_run.status)
    .bind(&step_run.output)
    .bind(&step_run.error)
    .bind(step_run.started_at)
    .bind(step_run.completed_at)
    .bind(&step_run.step_run_id)
    .execute(&self.pool)
    .await?;

    if updated.rows_affected() == 0 {
      return Err(Error::NotFound(format!("step run {}", step_run.step_run_id)));
    }
    Ok(())
  }

  async fn list_step_runs(&self, flow_run_id: &str) -> Result<Vec<FlowStepRun>, Error> {
    Ok(
      sqlx::query_as(select_step_runs!(
        "WHERE flow_run_id = ? ORDER BY step_index ASC, retry_attempt ASC"
      ))
      .bind(flow_run_id)
      .fetch_all(&self.pool)
      .await?,
    )
  }
}
