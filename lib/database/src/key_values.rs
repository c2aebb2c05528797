use sqlx::SqliteExecutor;

/// Runtime configuration keys written at provisioning time.
pub const DISCO_HOST: &str = "DISCO_HOST";
pub const DISCO_IP: &str = "DISCO_IP";
pub const DISCO_ADVERTISE_ADDR: &str = "DISCO_ADVERTISE_ADDR";
pub const REGISTRY_HOST: &str = "REGISTRY_HOST";
pub const SYSLOG_URLS: &str = "SYSLOG_URLS";

pub async fn get_value(
  db: impl SqliteExecutor<'_>,
  key: &str,
) -> anyhow::Result<Option<String>> {
  let value: Option<Option<String>> = sqlx::query_scalar(
    "SELECT value FROM key_values WHERE key = ?",
  )
  .bind(key)
  .fetch_optional(db)
  .await?;
  Ok(value.flatten())
}

pub async fn set_value(
  db: impl SqliteExecutor<'_>,
  key: &str,
  value: Option<&str>,
) -> anyhow::Result<()> {
  sqlx::query(
    "INSERT INTO key_values (key, value) VALUES (?, ?) \
     ON CONFLICT (key) DO UPDATE SET value = excluded.value",
  )
  .bind(key)
  .bind(value)
  .execute(db)
  .await?;
  Ok(())
}

pub async fn delete_value(
  db: impl SqliteExecutor<'_>,
  key: &str,
) -> anyhow::Result<()> {
  sqlx::query("DELETE FROM key_values WHERE key = ?")
    .bind(key)
    .execute(db)
    .await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::DbClient;

  #[tokio::test]
  async fn set_get_overwrite_delete() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    assert_eq!(get_value(pool, DISCO_HOST).await.unwrap(), None);
    set_value(pool, DISCO_HOST, Some("disco.example.com"))
      .await
      .unwrap();
    assert_eq!(
      get_value(pool, DISCO_HOST).await.unwrap().as_deref(),
      Some("disco.example.com")
    );
    set_value(pool, DISCO_HOST, Some("disco2.example.com"))
      .await
      .unwrap();
    assert_eq!(
      get_value(pool, DISCO_HOST).await.unwrap().as_deref(),
      Some("disco2.example.com")
    );
    delete_value(pool, DISCO_HOST).await.unwrap();
    assert_eq!(get_value(pool, DISCO_HOST).await.unwrap(), None);
  }
}
