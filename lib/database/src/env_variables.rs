use disco_client::entities::{
  disco_timestamp, new_id, project::ProjectEnvVar,
};
use sqlx::SqliteExecutor;

/// Upsert an encrypted project env variable.
pub async fn set(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
  name: &str,
  encrypted_value: &str,
  by_api_key_id: Option<&str>,
) -> anyhow::Result<()> {
  sqlx::query(
    "INSERT INTO project_env_variables \
     (id, project_id, name, value, by_api_key_id, created) \
     VALUES (?, ?, ?, ?, ?, ?) \
     ON CONFLICT (project_id, name) DO UPDATE \
     SET value = excluded.value, \
         by_api_key_id = excluded.by_api_key_id",
  )
  .bind(new_id())
  .bind(project_id)
  .bind(name)
  .bind(encrypted_value)
  .bind(by_api_key_id)
  .bind(disco_timestamp())
  .execute(db)
  .await?;
  Ok(())
}

pub async fn get_for_project(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
) -> anyhow::Result<Vec<ProjectEnvVar>> {
  let env_vars = sqlx::query_as(
    "SELECT * FROM project_env_variables \
     WHERE project_id = ? ORDER BY name",
  )
  .bind(project_id)
  .fetch_all(db)
  .await?;
  Ok(env_vars)
}

pub async fn delete(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
  name: &str,
) -> anyhow::Result<bool> {
  let result = sqlx::query(
    "DELETE FROM project_env_variables \
     WHERE project_id = ? AND name = ?",
  )
  .bind(project_id)
  .bind(name)
  .execute(db)
  .await?;
  Ok(result.rows_affected() > 0)
}

pub async fn delete_all_for_project(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
) -> anyhow::Result<()> {
  sqlx::query(
    "DELETE FROM project_env_variables WHERE project_id = ?",
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
  async fn upsert_replaces_value() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let project =
      crate::projects::create(pool, "api", None, None, None)
        .await
        .unwrap();
    set(pool, &project.id, "FOO", "ct-1", None).await.unwrap();
    set(pool, &project.id, "FOO", "ct-2", None).await.unwrap();
    let env_vars =
      get_for_project(pool, &project.id).await.unwrap();
    assert_eq!(env_vars.len(), 1);
    assert_eq!(env_vars[0].value, "ct-2");
    assert!(delete(pool, &project.id, "FOO").await.unwrap());
    assert!(!delete(pool, &project.id, "FOO").await.unwrap());
  }
}
