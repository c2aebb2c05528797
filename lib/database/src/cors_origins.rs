use disco_client::entities::{disco_timestamp, new_id};
use sqlx::SqliteExecutor;

/// Add an allowed CORS origin. Re-adding an existing origin is a
/// no-op, not an error.
pub async fn add(
  db: impl SqliteExecutor<'_>,
  origin: &str,
  by_api_key_id: Option<&str>,
) -> anyhow::Result<()> {
  sqlx::query(
    "INSERT INTO cors_origins (id, origin, by_api_key_id, created) \
     VALUES (?, ?, ?, ?) \
     ON CONFLICT (origin) DO NOTHING",
  )
  .bind(new_id())
  .bind(origin)
  .bind(by_api_key_id)
  .bind(disco_timestamp())
  .execute(db)
  .await?;
  Ok(())
}

pub async fn remove(
  db: impl SqliteExecutor<'_>,
  origin: &str,
) -> anyhow::Result<bool> {
  let result =
    sqlx::query("DELETE FROM cors_origins WHERE origin = ?")
      .bind(origin)
      .execute(db)
      .await?;
  Ok(result.rows_affected() > 0)
}

pub async fn get_all(
  db: impl SqliteExecutor<'_>,
) -> anyhow::Result<Vec<String>> {
  let origins = sqlx::query_scalar(
    "SELECT origin FROM cors_origins ORDER BY created",
  )
  .fetch_all(db)
  .await?;
  Ok(origins)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::DbClient;

  #[tokio::test]
  async fn re_adding_is_a_no_op() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    add(pool, "https://app.example.com", None).await.unwrap();
    add(pool, "https://app.example.com", None).await.unwrap();
    assert_eq!(
      get_all(pool).await.unwrap(),
      vec!["https://app.example.com"]
    );
    assert!(remove(pool, "https://app.example.com").await.unwrap());
    assert!(
      !remove(pool, "https://app.example.com").await.unwrap()
    );
  }
}
