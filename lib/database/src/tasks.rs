use disco_client::entities::{
  disco_timestamp, new_id,
  task::{Task, TaskName, TaskStatus},
};
use sqlx::{SqliteExecutor, SqlitePool};

/// Enqueue a task. Runs on any executor so callers can enqueue in
/// the same transaction that creates the rows the task refers to.
pub async fn enqueue(
  db: impl SqliteExecutor<'_>,
  name: TaskName,
  body: &impl serde::Serialize,
) -> anyhow::Result<Task> {
  let task = Task {
    id: new_id(),
    name,
    status: TaskStatus::Queued,
    body: serde_json::to_string(body)?,
    result: None,
    created: disco_timestamp(),
  };
  sqlx::query(
    "INSERT INTO tasks (id, name, status, body, result, created) \
     VALUES (?, ?, ?, ?, ?, ?)",
  )
  .bind(&task.id)
  .bind(task.name)
  .bind(task.status)
  .bind(&task.body)
  .bind(&task.result)
  .bind(task.created)
  .execute(db)
  .await?;
  info!("enqueued task {name}");
  Ok(task)
}

pub async fn get_by_id(
  db: impl SqliteExecutor<'_>,
  id: &str,
) -> anyhow::Result<Option<Task>> {
  let task = sqlx::query_as("SELECT * FROM tasks WHERE id = ?")
    .bind(id)
    .fetch_optional(db)
    .await?;
  Ok(task)
}

/// Claim the oldest QUEUED task by flipping it to PROCESSING in the
/// same statement that selects it, so concurrent consumers never
/// claim the same task twice.
pub async fn claim_next(
  pool: &SqlitePool,
) -> anyhow::Result<Option<Task>> {
  let task = sqlx::query_as(
    "UPDATE tasks SET status = 'PROCESSING' \
     WHERE id = (\
       SELECT id FROM tasks WHERE status = 'QUEUED' \
       ORDER BY created ASC, id ASC LIMIT 1) \
     RETURNING *",
  )
  .fetch_optional(pool)
  .await?;
  Ok(task)
}

/// Terminal transition; a second call on a terminal task is a no-op.
pub async fn complete(
  db: impl SqliteExecutor<'_>,
  id: &str,
  result: &serde_json::Value,
) -> anyhow::Result<()> {
  finish(db, id, TaskStatus::Completed, result).await
}

pub async fn fail(
  db: impl SqliteExecutor<'_>,
  id: &str,
  result: &serde_json::Value,
) -> anyhow::Result<()> {
  finish(db, id, TaskStatus::Failed, result).await
}

async fn finish(
  db: impl SqliteExecutor<'_>,
  id: &str,
  status: TaskStatus,
  result: &serde_json::Value,
) -> anyhow::Result<()> {
  sqlx::query(
    "UPDATE tasks SET status = ?, result = ? \
     WHERE id = ? AND status NOT IN ('COMPLETED', 'FAILED')",
  )
  .bind(status)
  .bind(result.to_string())
  .bind(id)
  .execute(db)
  .await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::DbClient;

  #[tokio::test]
  async fn claims_fifo_and_flips_to_processing() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let first = enqueue(
      pool,
      TaskName::ProcessDeployment,
      &json!({"deployment_id": "a"}),
    )
    .await
    .unwrap();
    let second = enqueue(
      pool,
      TaskName::ProcessDeployment,
      &json!({"deployment_id": "b"}),
    )
    .await
    .unwrap();
    let claimed = claim_next(pool).await.unwrap().unwrap();
    assert_eq!(claimed.id, first.id);
    assert_eq!(claimed.status, TaskStatus::Processing);
    let claimed = claim_next(pool).await.unwrap().unwrap();
    assert_eq!(claimed.id, second.id);
    assert!(claim_next(pool).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn completion_is_idempotent() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let task = enqueue(
      pool,
      TaskName::ProcessGithubWebhook,
      &json!({"app_id": 1}),
    )
    .await
    .unwrap();
    claim_next(pool).await.unwrap().unwrap();
    complete(pool, &task.id, &json!({"ok": true}))
      .await
      .unwrap();
    // second terminal write does not overwrite the first
    fail(pool, &task.id, &json!({"reason": "EXCEPTION"}))
      .await
      .unwrap();
    let task = get_by_id(pool, &task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.result.as_deref(), Some(r#"{"ok":true}"#));
  }

  #[tokio::test]
  async fn processing_tasks_are_not_reclaimed() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    enqueue(pool, TaskName::ProcessDeployment, &json!({}))
      .await
      .unwrap();
    assert!(claim_next(pool).await.unwrap().is_some());
    assert!(claim_next(pool).await.unwrap().is_none());
  }
}
