use anyhow::anyhow;
use chrono::{Duration, Utc};
use disco_client::entities::{
  api_key::{ApiKey, ApiKeyInvite},
  disco_timestamp, new_id,
};
use rand::RngCore;
use sqlx::{SqliteExecutor, SqlitePool};

fn token_hex() -> String {
  let mut bytes = [0u8; 16];
  rand::rng().fill_bytes(&mut bytes);
  hex::encode(bytes)
}

pub async fn create(
  db: impl SqliteExecutor<'_>,
  name: &str,
) -> anyhow::Result<ApiKey> {
  let api_key = ApiKey {
    id: token_hex(),
    name: name.to_string(),
    public_key: token_hex(),
    deleted: None,
    created: disco_timestamp(),
  };
  sqlx::query(
    "INSERT INTO api_keys (id, name, public_key, deleted, created) \
     VALUES (?, ?, ?, ?, ?)",
  )
  .bind(&api_key.id)
  .bind(&api_key.name)
  .bind(&api_key.public_key)
  .bind(api_key.deleted)
  .bind(api_key.created)
  .execute(db)
  .await?;
  info!("created {}", api_key.log());
  Ok(api_key)
}

/// Look up a non-deleted key by its secret id.
pub async fn get_valid_by_id(
  db: impl SqliteExecutor<'_>,
  id: &str,
) -> anyhow::Result<Option<ApiKey>> {
  let api_key = sqlx::query_as(
    "SELECT * FROM api_keys WHERE id = ? AND deleted IS NULL",
  )
  .bind(id)
  .fetch_optional(db)
  .await?;
  Ok(api_key)
}

pub async fn get_by_public_key(
  db: impl SqliteExecutor<'_>,
  public_key: &str,
) -> anyhow::Result<Option<ApiKey>> {
  let api_key = sqlx::query_as(
    "SELECT * FROM api_keys \
     WHERE public_key = ? AND deleted IS NULL",
  )
  .bind(public_key)
  .fetch_optional(db)
  .await?;
  Ok(api_key)
}

pub async fn get_all(
  db: impl SqliteExecutor<'_>,
) -> anyhow::Result<Vec<ApiKey>> {
  let api_keys = sqlx::query_as(
    "SELECT * FROM api_keys WHERE deleted IS NULL \
     ORDER BY created ASC",
  )
  .fetch_all(db)
  .await?;
  Ok(api_keys)
}

/// Soft-delete a key. Deleting the last live key is rejected so the
/// operator can never lock themselves out.
pub async fn delete(
  pool: &SqlitePool,
  id: &str,
) -> anyhow::Result<()> {
  let mut tx = pool.begin().await?;
  let live: i64 = sqlx::query_scalar(
    "SELECT COUNT(*) FROM api_keys WHERE deleted IS NULL",
  )
  .fetch_one(&mut *tx)
  .await?;
  if live <= 1 {
    return Err(anyhow!("cannot delete the last API key"));
  }
  sqlx::query(
    "UPDATE api_keys SET deleted = ? \
     WHERE id = ? AND deleted IS NULL",
  )
  .bind(disco_timestamp())
  .bind(id)
  .execute(&mut *tx)
  .await?;
  tx.commit().await?;
  Ok(())
}

/// Record a usage; retention is bounded by [prune_usages].
pub async fn record_usage(
  db: impl SqliteExecutor<'_>,
  api_key_id: &str,
) -> anyhow::Result<()> {
  sqlx::query(
    "INSERT INTO api_key_usages (id, api_key_id, created) \
     VALUES (?, ?, ?)",
  )
  .bind(new_id())
  .bind(api_key_id)
  .bind(disco_timestamp())
  .execute(db)
  .await?;
  Ok(())
}

pub async fn prune_usages(
  db: impl SqliteExecutor<'_>,
  keep_days: i64,
) -> anyhow::Result<u64> {
  let cutoff = Utc::now() - Duration::days(keep_days);
  let result = sqlx::query(
    "DELETE FROM api_key_usages WHERE created < ?",
  )
  .bind(cutoff)
  .execute(db)
  .await?;
  Ok(result.rows_affected())
}

/// Create an invite. Expiry is clamped to 24 hours.
pub async fn create_invite(
  db: impl SqliteExecutor<'_>,
  name: &str,
  expires_in_hours: i64,
  by_api_key_id: &str,
) -> anyhow::Result<ApiKeyInvite> {
  let invite = ApiKeyInvite {
    id: token_hex(),
    name: name.to_string(),
    expires: disco_timestamp()
      + Duration::hours(expires_in_hours.clamp(1, 24)),
    by_api_key_id: by_api_key_id.to_string(),
    created: disco_timestamp(),
  };
  sqlx::query(
    "INSERT INTO api_key_invites \
     (id, name, expires, by_api_key_id, created) \
     VALUES (?, ?, ?, ?, ?)",
  )
  .bind(&invite.id)
  .bind(&invite.name)
  .bind(invite.expires)
  .bind(&invite.by_api_key_id)
  .bind(invite.created)
  .execute(db)
  .await?;
  Ok(invite)
}

/// Consume an invite, minting an [ApiKey] carrying the invite's
/// name. Expired or already-consumed invites yield nothing.
pub async fn use_invite(
  pool: &SqlitePool,
  invite_id: &str,
) -> anyhow::Result<Option<ApiKey>> {
  let mut tx = pool.begin().await?;
  let invite: Option<ApiKeyInvite> = sqlx::query_as(
    "SELECT * FROM api_key_invites WHERE id = ?",
  )
  .bind(invite_id)
  .fetch_optional(&mut *tx)
  .await?;
  let Some(invite) = invite else {
    return Ok(None);
  };
  if invite.is_expired(Utc::now()) {
    return Ok(None);
  }
  sqlx::query("DELETE FROM api_key_invites WHERE id = ?")
    .bind(invite_id)
    .execute(&mut *tx)
    .await?;
  let api_key = create(&mut *tx, &invite.name).await?;
  tx.commit().await?;
  Ok(Some(api_key))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::DbClient;

  #[tokio::test]
  async fn last_key_cannot_be_deleted() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let only = create(pool, "root").await.unwrap();
    assert!(delete(pool, &only.id).await.is_err());
    let second = create(pool, "ci").await.unwrap();
    delete(pool, &second.id).await.unwrap();
    assert_eq!(get_all(pool).await.unwrap().len(), 1);
    // deleted keys no longer authenticate
    assert!(
      get_valid_by_id(pool, &second.id)
        .await
        .unwrap()
        .is_none()
    );
  }

  #[tokio::test]
  async fn invites_are_single_use() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let root = create(pool, "root").await.unwrap();
    let invite =
      create_invite(pool, "teammate", 24, &root.id)
        .await
        .unwrap();
    let minted =
      use_invite(pool, &invite.id).await.unwrap().unwrap();
    assert_eq!(minted.name, "teammate");
    assert!(use_invite(pool, &invite.id).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn invite_expiry_is_clamped_to_a_day() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let root = create(pool, "root").await.unwrap();
    let invite = create_invite(pool, "x", 9999, &root.id)
      .await
      .unwrap();
    assert!(
      invite.expires - invite.created
        <= Duration::hours(24)
    );
  }
}
