use chrono::{Duration, Utc};
use disco_client::entities::{
  disco_timestamp,
  github::{
    GithubApp, GithubAppInstallation, GithubAppRepo,
    PendingGithubApp,
  },
  new_id,
};
use rand::RngCore;
use sqlx::SqliteExecutor;

pub async fn create_app(
  db: impl SqliteExecutor<'_>,
  app: &GithubApp,
) -> anyhow::Result<()> {
  sqlx::query(
    "INSERT INTO github_apps \
     (id, slug, name, owner_id, owner_login, owner_type, \
      webhook_secret, pem, client_secret, html_url, created) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
  )
  .bind(app.id)
  .bind(&app.slug)
  .bind(&app.name)
  .bind(app.owner_id)
  .bind(&app.owner_login)
  .bind(&app.owner_type)
  .bind(&app.webhook_secret)
  .bind(&app.pem)
  .bind(&app.client_secret)
  .bind(&app.html_url)
  .bind(app.created)
  .execute(db)
  .await?;
  Ok(())
}

pub async fn get_app_by_id(
  db: impl SqliteExecutor<'_>,
  id: i64,
) -> anyhow::Result<Option<GithubApp>> {
  let app = sqlx::query_as("SELECT * FROM github_apps WHERE id = ?")
    .bind(id)
    .fetch_optional(db)
    .await?;
  Ok(app)
}

pub async fn get_all_apps(
  db: impl SqliteExecutor<'_>,
) -> anyhow::Result<Vec<GithubApp>> {
  let apps = sqlx::query_as(
    "SELECT * FROM github_apps ORDER BY owner_login",
  )
  .fetch_all(db)
  .await?;
  Ok(apps)
}

pub async fn add_installation(
  db: impl SqliteExecutor<'_>,
  id: i64,
  github_app_id: i64,
) -> anyhow::Result<()> {
  sqlx::query(
    "INSERT INTO github_app_installations \
     (id, github_app_id, created) VALUES (?, ?, ?) \
     ON CONFLICT (id) DO NOTHING",
  )
  .bind(id)
  .bind(github_app_id)
  .bind(disco_timestamp())
  .execute(db)
  .await?;
  Ok(())
}

pub async fn get_installation(
  db: impl SqliteExecutor<'_>,
  id: i64,
) -> anyhow::Result<Option<GithubAppInstallation>> {
  let installation = sqlx::query_as(
    "SELECT * FROM github_app_installations WHERE id = ?",
  )
  .bind(id)
  .fetch_optional(db)
  .await?;
  Ok(installation)
}

pub async fn remove_installation(
  db: impl SqliteExecutor<'_>,
  id: i64,
) -> anyhow::Result<()> {
  sqlx::query(
    "DELETE FROM github_app_repos WHERE installation_id = ?",
  )
  .bind(id)
  .execute(db)
  .await?;
  Ok(())
}

/// Remove the installation row itself, after its repos.
pub async fn delete_installation_record(
  db: impl SqliteExecutor<'_>,
  id: i64,
) -> anyhow::Result<()> {
  sqlx::query("DELETE FROM github_app_installations WHERE id = ?")
    .bind(id)
    .execute(db)
    .await?;
  Ok(())
}

pub async fn add_repo(
  db: impl SqliteExecutor<'_>,
  installation_id: i64,
  full_name: &str,
) -> anyhow::Result<()> {
  sqlx::query(
    "INSERT INTO github_app_repos \
     (id, installation_id, full_name, created) \
     VALUES (?, ?, ?, ?) \
     ON CONFLICT (installation_id, full_name) DO NOTHING",
  )
  .bind(new_id())
  .bind(installation_id)
  .bind(full_name)
  .bind(disco_timestamp())
  .execute(db)
  .await?;
  Ok(())
}

pub async fn remove_repo(
  db: impl SqliteExecutor<'_>,
  installation_id: i64,
  full_name: &str,
) -> anyhow::Result<()> {
  sqlx::query(
    "DELETE FROM github_app_repos \
     WHERE installation_id = ? AND full_name = ?",
  )
  .bind(installation_id)
  .bind(full_name)
  .execute(db)
  .await?;
  Ok(())
}

pub async fn get_repos_for_installation(
  db: impl SqliteExecutor<'_>,
  installation_id: i64,
) -> anyhow::Result<Vec<GithubAppRepo>> {
  let repos = sqlx::query_as(
    "SELECT * FROM github_app_repos \
     WHERE installation_id = ? ORDER BY full_name",
  )
  .bind(installation_id)
  .fetch_all(db)
  .await?;
  Ok(repos)
}

pub async fn create_pending_app(
  db: impl SqliteExecutor<'_>,
  organization: Option<&str>,
) -> anyhow::Result<PendingGithubApp> {
  let mut state = [0u8; 16];
  rand::rng().fill_bytes(&mut state);
  let pending = PendingGithubApp {
    id: new_id(),
    state: hex::encode(state),
    organization: organization.map(str::to_string),
    expires: disco_timestamp() + Duration::minutes(30),
    created: disco_timestamp(),
  };
  sqlx::query(
    "INSERT INTO pending_github_apps \
     (id, state, organization, expires, created) \
     VALUES (?, ?, ?, ?, ?)",
  )
  .bind(&pending.id)
  .bind(&pending.state)
  .bind(&pending.organization)
  .bind(pending.expires)
  .bind(pending.created)
  .execute(db)
  .await?;
  Ok(pending)
}

pub async fn get_pending_app(
  db: impl SqliteExecutor<'_>,
  id: &str,
) -> anyhow::Result<Option<PendingGithubApp>> {
  let pending = sqlx::query_as(
    "SELECT * FROM pending_github_apps WHERE id = ?",
  )
  .bind(id)
  .fetch_optional(db)
  .await?;
  Ok(pending)
}

pub async fn delete_pending_app(
  db: impl SqliteExecutor<'_>,
  id: &str,
) -> anyhow::Result<()> {
  sqlx::query("DELETE FROM pending_github_apps WHERE id = ?")
    .bind(id)
    .execute(db)
    .await?;
  Ok(())
}

/// Drop pending apps whose registration window lapsed.
pub async fn prune_expired_pending_apps(
  db: impl SqliteExecutor<'_>,
) -> anyhow::Result<u64> {
  let result = sqlx::query(
    "DELETE FROM pending_github_apps WHERE expires < ?",
  )
  .bind(Utc::now())
  .execute(db)
  .await?;
  Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::DbClient;

  #[tokio::test]
  async fn installation_repo_reconciliation() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let app = GithubApp {
      id: 77,
      slug: "disco-ci".into(),
      name: "Disco CI".into(),
      owner_id: 1,
      owner_login: "octocat".into(),
      owner_type: "User".into(),
      webhook_secret: "ct".into(),
      pem: "ct".into(),
      client_secret: "ct".into(),
      html_url: "https://github.com/apps/disco-ci".into(),
      created: disco_timestamp(),
    };
    create_app(pool, &app).await.unwrap();
    add_installation(pool, 1001, app.id).await.unwrap();
    add_repo(pool, 1001, "octocat/api").await.unwrap();
    add_repo(pool, 1001, "octocat/api").await.unwrap();
    add_repo(pool, 1001, "octocat/blog").await.unwrap();
    assert_eq!(
      get_repos_for_installation(pool, 1001)
        .await
        .unwrap()
        .len(),
      2
    );
    remove_repo(pool, 1001, "octocat/blog").await.unwrap();
    assert_eq!(
      get_repos_for_installation(pool, 1001)
        .await
        .unwrap()
        .len(),
      1
    );
  }
}
