use disco_client::entities::{
  EnvVar, disco_timestamp, new_id,
  deployment::{Deployment, DeploymentStatus},
  project::Project,
};
use sqlx::{SqliteConnection, SqliteExecutor};

pub struct NewDeployment<'a> {
  pub project: &'a Project,
  pub commit_hash: Option<String>,
  pub disco_file: Option<String>,
  pub registry_host: Option<String>,
  pub domain: Option<String>,
  pub by_api_key_id: Option<String>,
  /// Encrypted (name, value) pairs snapshotted from the project.
  pub env_variables: Vec<EnvVar>,
}

/// Insert a QUEUED deployment, allocating the next per-project
/// number. Runs on a connection so the caller can enqueue the
/// matching task in the same transaction.
pub async fn create(
  db: &mut SqliteConnection,
  new: NewDeployment<'_>,
) -> anyhow::Result<Deployment> {
  let number = next_number(&mut *db, &new.project.id).await?;
  let prev = get_live(&mut *db, &new.project.id).await?;
  let deployment = Deployment {
    id: new_id(),
    project_id: new.project.id.clone(),
    number,
    status: DeploymentStatus::Queued,
    commit_hash: new.commit_hash,
    disco_file: new.disco_file,
    project_name: new.project.name.clone(),
    registry_host: new.registry_host,
    domain: new.domain,
    github_repo: new.project.github_repo.clone(),
    branch: new.project.branch.clone(),
    prev_deployment_id: prev.map(|d| d.id),
    by_api_key_id: new.by_api_key_id,
    task_id: None,
    created: disco_timestamp(),
  };
  sqlx::query(
    "INSERT INTO deployments \
     (id, project_id, number, status, commit_hash, disco_file, \
      project_name, registry_host, domain, github_repo, branch, \
      prev_deployment_id, by_api_key_id, task_id, created) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
  )
  .bind(&deployment.id)
  .bind(&deployment.project_id)
  .bind(deployment.number)
  .bind(deployment.status)
  .bind(&deployment.commit_hash)
  .bind(&deployment.disco_file)
  .bind(&deployment.project_name)
  .bind(&deployment.registry_host)
  .bind(&deployment.domain)
  .bind(&deployment.github_repo)
  .bind(&deployment.branch)
  .bind(&deployment.prev_deployment_id)
  .bind(&deployment.by_api_key_id)
  .bind(&deployment.task_id)
  .bind(deployment.created)
  .execute(&mut *db)
  .await?;
  for env_var in &new.env_variables {
    sqlx::query(
      "INSERT INTO deployment_env_variables \
       (id, deployment_id, name, value, created) \
       VALUES (?, ?, ?, ?, ?)",
    )
    .bind(new_id())
    .bind(&deployment.id)
    .bind(&env_var.name)
    .bind(&env_var.value)
    .bind(deployment.created)
    .execute(&mut *db)
    .await?;
  }
  Ok(deployment)
}

async fn next_number(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
) -> anyhow::Result<i64> {
  let latest: Option<i64> = sqlx::query_scalar(
    "SELECT MAX(number) FROM deployments WHERE project_id = ?",
  )
  .bind(project_id)
  .fetch_one(db)
  .await?;
  Ok(latest.unwrap_or(0) + 1)
}

pub async fn get_by_id(
  db: impl SqliteExecutor<'_>,
  id: &str,
) -> anyhow::Result<Option<Deployment>> {
  let deployment =
    sqlx::query_as("SELECT * FROM deployments WHERE id = ?")
      .bind(id)
      .fetch_optional(db)
      .await?;
  Ok(deployment)
}

pub async fn get_by_number(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
  number: i64,
) -> anyhow::Result<Option<Deployment>> {
  let deployment = sqlx::query_as(
    "SELECT * FROM deployments \
     WHERE project_id = ? AND number = ?",
  )
  .bind(project_id)
  .bind(number)
  .fetch_optional(db)
  .await?;
  Ok(deployment)
}

/// The live deployment: newest COMPLETE for the project, or none.
pub async fn get_live(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
) -> anyhow::Result<Option<Deployment>> {
  let deployment = sqlx::query_as(
    "SELECT * FROM deployments \
     WHERE project_id = ? AND status = 'COMPLETE' \
     ORDER BY number DESC LIMIT 1",
  )
  .bind(project_id)
  .fetch_optional(db)
  .await?;
  Ok(deployment)
}

/// Whether the project already has a deployment being prepared.
/// Such a deployment blocks queueing another one.
pub async fn has_active(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
) -> anyhow::Result<bool> {
  let count: i64 = sqlx::query_scalar(
    "SELECT COUNT(*) FROM deployments \
     WHERE project_id = ? AND status IN ('QUEUED', 'IN_PROGRESS')",
  )
  .bind(project_id)
  .fetch_one(db)
  .await?;
  Ok(count > 0)
}

/// Deployments that are live or on their way to being live, per
/// project, newest first. Feeds the image garbage collector: images
/// of anything returned here must be kept.
pub async fn get_active(
  db: impl SqliteExecutor<'_>,
) -> anyhow::Result<Vec<Deployment>> {
  let deployments = sqlx::query_as(
    "SELECT d.* FROM deployments d \
     WHERE d.status IN ('QUEUED', 'IN_PROGRESS') \
        OR (d.status = 'COMPLETE' AND d.number = (\
          SELECT MAX(number) FROM deployments \
          WHERE project_id = d.project_id AND status = 'COMPLETE'))",
  )
  .fetch_all(db)
  .await?;
  Ok(deployments)
}

pub async fn set_status(
  db: impl SqliteExecutor<'_>,
  id: &str,
  status: DeploymentStatus,
) -> anyhow::Result<()> {
  sqlx::query("UPDATE deployments SET status = ? WHERE id = ?")
    .bind(status)
    .bind(id)
    .execute(db)
    .await?;
  Ok(())
}

/// Record the resolved commit. Only legal while QUEUED or
/// IN_PROGRESS and the hash is being pinned for the first time;
/// after that the snapshot is immutable.
pub async fn set_commit_hash(
  db: impl SqliteExecutor<'_>,
  id: &str,
  commit_hash: &str,
) -> anyhow::Result<()> {
  sqlx::query(
    "UPDATE deployments SET commit_hash = ? \
     WHERE id = ? AND status IN ('QUEUED', 'IN_PROGRESS')",
  )
  .bind(commit_hash)
  .bind(id)
  .execute(db)
  .await?;
  Ok(())
}

pub async fn set_disco_file(
  db: impl SqliteExecutor<'_>,
  id: &str,
  disco_file: &str,
) -> anyhow::Result<()> {
  sqlx::query(
    "UPDATE deployments SET disco_file = ? \
     WHERE id = ? AND status IN ('QUEUED', 'IN_PROGRESS')",
  )
  .bind(disco_file)
  .bind(id)
  .execute(db)
  .await?;
  Ok(())
}

pub async fn set_task_id(
  db: impl SqliteExecutor<'_>,
  id: &str,
  task_id: &str,
) -> anyhow::Result<()> {
  sqlx::query("UPDATE deployments SET task_id = ? WHERE id = ?")
    .bind(task_id)
    .bind(id)
    .execute(db)
    .await?;
  Ok(())
}

/// The encrypted env var snapshot taken at creation.
pub async fn get_env_variables(
  db: impl SqliteExecutor<'_>,
  deployment_id: &str,
) -> anyhow::Result<Vec<EnvVar>> {
  let rows: Vec<(String, String)> = sqlx::query_as(
    "SELECT name, value FROM deployment_env_variables \
     WHERE deployment_id = ? ORDER BY name",
  )
  .bind(deployment_id)
  .fetch_all(db)
  .await?;
  Ok(
    rows
      .into_iter()
      .map(|(name, value)| EnvVar { name, value })
      .collect(),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::DbClient;

  async fn project(client: &DbClient) -> Project {
    crate::projects::create(&client.pool, "api", None, None, None)
      .await
      .unwrap()
  }

  fn new<'a>(project: &'a Project) -> NewDeployment<'a> {
    NewDeployment {
      project,
      commit_hash: None,
      disco_file: None,
      registry_host: None,
      domain: None,
      by_api_key_id: None,
      env_variables: vec![],
    }
  }

  #[tokio::test]
  async fn numbers_are_contiguous_from_one() {
    let client = DbClient::new_in_memory().await.unwrap();
    let project = project(&client).await;
    for expected in 1..=3 {
      let mut conn = client.pool.acquire().await.unwrap();
      let deployment =
        create(&mut conn, new(&project)).await.unwrap();
      assert_eq!(deployment.number, expected);
    }
  }

  #[tokio::test]
  async fn live_is_newest_complete() {
    let client = DbClient::new_in_memory().await.unwrap();
    let project = project(&client).await;
    let mut conn = client.pool.acquire().await.unwrap();
    let d1 = create(&mut conn, new(&project)).await.unwrap();
    let d2 = create(&mut conn, new(&project)).await.unwrap();
    let d3 = create(&mut conn, new(&project)).await.unwrap();
    drop(conn);
    let pool = &client.pool;
    set_status(pool, &d1.id, DeploymentStatus::Complete)
      .await
      .unwrap();
    set_status(pool, &d2.id, DeploymentStatus::Complete)
      .await
      .unwrap();
    set_status(pool, &d3.id, DeploymentStatus::Failed)
      .await
      .unwrap();
    // a FAILED successor does not take over liveness
    let live = get_live(pool, &project.id).await.unwrap().unwrap();
    assert_eq!(live.id, d2.id);
  }

  #[tokio::test]
  async fn queued_or_in_progress_blocks_new_ones() {
    let client = DbClient::new_in_memory().await.unwrap();
    let project = project(&client).await;
    let mut conn = client.pool.acquire().await.unwrap();
    let d1 = create(&mut conn, new(&project)).await.unwrap();
    drop(conn);
    assert!(has_active(&client.pool, &project.id).await.unwrap());
    set_status(
      &client.pool,
      &d1.id,
      DeploymentStatus::InProgress,
    )
    .await
    .unwrap();
    assert!(has_active(&client.pool, &project.id).await.unwrap());
    set_status(&client.pool, &d1.id, DeploymentStatus::Complete)
      .await
      .unwrap();
    assert!(!has_active(&client.pool, &project.id).await.unwrap());
  }

  #[tokio::test]
  async fn snapshot_is_frozen_after_terminal_status() {
    let client = DbClient::new_in_memory().await.unwrap();
    let project = project(&client).await;
    let mut conn = client.pool.acquire().await.unwrap();
    let deployment =
      create(&mut conn, new(&project)).await.unwrap();
    drop(conn);
    let pool = &client.pool;
    set_commit_hash(pool, &deployment.id, "abc123")
      .await
      .unwrap();
    set_status(pool, &deployment.id, DeploymentStatus::Complete)
      .await
      .unwrap();
    set_commit_hash(pool, &deployment.id, "def456")
      .await
      .unwrap();
    set_disco_file(pool, &deployment.id, "{}").await.unwrap();
    let reloaded = get_by_id(pool, &deployment.id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(reloaded.commit_hash.as_deref(), Some("abc123"));
    assert_eq!(reloaded.disco_file, None);
  }

  #[tokio::test]
  async fn env_snapshot_round_trips() {
    let client = DbClient::new_in_memory().await.unwrap();
    let project = project(&client).await;
    let mut conn = client.pool.acquire().await.unwrap();
    let deployment = create(
      &mut conn,
      NewDeployment {
        env_variables: vec![
          EnvVar::new("FOO", "ciphertext-1"),
          EnvVar::new("BAR", "ciphertext-2"),
        ],
        ..new(&project)
      },
    )
    .await
    .unwrap();
    drop(conn);
    let env_vars =
      get_env_variables(&client.pool, &deployment.id)
        .await
        .unwrap();
    assert_eq!(
      env_vars,
      vec![
        EnvVar::new("BAR", "ciphertext-2"),
        EnvVar::new("FOO", "ciphertext-1"),
      ]
    );
  }
}
