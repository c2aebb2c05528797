use disco_client::entities::disco_timestamp;
use sqlx::SqliteExecutor;

/// Per-project settings. Values are encrypted by the caller before
/// they get here.
pub async fn set_value(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
  key: &str,
  value: Option<&str>,
) -> anyhow::Result<()> {
  sqlx::query(
    "INSERT INTO project_key_values \
     (project_id, key, value, created) VALUES (?, ?, ?, ?) \
     ON CONFLICT (project_id, key) \
     DO UPDATE SET value = excluded.value",
  )
  .bind(project_id)
  .bind(key)
  .bind(value)
  .bind(disco_timestamp())
  .execute(db)
  .await?;
  Ok(())
}

pub async fn get_value(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
  key: &str,
) -> anyhow::Result<Option<String>> {
  let value: Option<Option<String>> = sqlx::query_scalar(
    "SELECT value FROM project_key_values \
     WHERE project_id = ? AND key = ?",
  )
  .bind(project_id)
  .bind(key)
  .fetch_optional(db)
  .await?;
  Ok(value.flatten())
}

pub async fn get_all(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
) -> anyhow::Result<Vec<(String, Option<String>)>> {
  let pairs = sqlx::query_as(
    "SELECT key, value FROM project_key_values \
     WHERE project_id = ? ORDER BY key",
  )
  .bind(project_id)
  .fetch_all(db)
  .await?;
  Ok(pairs)
}

pub async fn delete_value(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
  key: &str,
) -> anyhow::Result<()> {
  sqlx::query(
    "DELETE FROM project_key_values \
     WHERE project_id = ? AND key = ?",
  )
  .bind(project_id)
  .bind(key)
  .execute(db)
  .await?;
  Ok(())
}

pub async fn delete_all_for_project(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
) -> anyhow::Result<()> {
  sqlx::query(
    "DELETE FROM project_key_values WHERE project_id = ?",
  )
  .bind(project_id)
  .execute(db)
  .await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::DbClient;

  #[tokio::test]
  async fn settings_are_scoped_per_project() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let a = crate::projects::create(pool, "a", None, None, None)
      .await
      .unwrap();
    let b = crate::projects::create(pool, "b", None, None, None)
      .await
      .unwrap();
    set_value(pool, &a.id, "region", Some("ct-eu")).await.unwrap();
    set_value(pool, &b.id, "region", Some("ct-us")).await.unwrap();
    assert_eq!(
      get_value(pool, &a.id, "region").await.unwrap().as_deref(),
      Some("ct-eu")
    );
    set_value(pool, &a.id, "region", Some("ct-ap")).await.unwrap();
    assert_eq!(get_all(pool, &a.id).await.unwrap().len(), 1);
    delete_all_for_project(pool, &a.id).await.unwrap();
    assert!(get_all(pool, &a.id).await.unwrap().is_empty());
    assert_eq!(get_all(pool, &b.id).await.unwrap().len(), 1);
  }
}
