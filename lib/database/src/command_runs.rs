use disco_client::entities::{
  command_run::{CommandRun, CommandRunStatus},
  disco_timestamp, new_id,
};
use sqlx::{SqliteConnection, SqliteExecutor};

/// Insert a CREATED run, allocating the next per-project number.
pub async fn create(
  db: &mut SqliteConnection,
  project_id: &str,
  deployment_id: &str,
  service: &str,
  command: &str,
  by_api_key_id: &str,
) -> anyhow::Result<CommandRun> {
  let latest: Option<i64> = sqlx::query_scalar(
    "SELECT MAX(number) FROM command_runs WHERE project_id = ?",
  )
  .bind(project_id)
  .fetch_one(&mut *db)
  .await?;
  let run = CommandRun {
    id: new_id(),
    project_id: project_id.to_string(),
    number: latest.unwrap_or(0) + 1,
    service: service.to_string(),
    command: command.to_string(),
    status: CommandRunStatus::Created,
    deployment_id: deployment_id.to_string(),
    by_api_key_id: by_api_key_id.to_string(),
    created: disco_timestamp(),
  };
  sqlx::query(
    "INSERT INTO command_runs \
     (id, project_id, number, service, command, status, \
      deployment_id, by_api_key_id, created) \
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
  )
  .bind(&run.id)
  .bind(&run.project_id)
  .bind(run.number)
  .bind(&run.service)
  .bind(&run.command)
  .bind(run.status)
  .bind(&run.deployment_id)
  .bind(&run.by_api_key_id)
  .bind(run.created)
  .execute(&mut *db)
  .await?;
  Ok(run)
}

pub async fn get_by_number(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
  number: i64,
) -> anyhow::Result<Option<CommandRun>> {
  let run = sqlx::query_as(
    "SELECT * FROM command_runs \
     WHERE project_id = ? AND number = ?",
  )
  .bind(project_id)
  .bind(number)
  .fetch_optional(db)
  .await?;
  Ok(run)
}

pub async fn set_status(
  db: impl SqliteExecutor<'_>,
  id: &str,
  status: CommandRunStatus,
) -> anyhow::Result<()> {
  sqlx::query("UPDATE command_runs SET status = ? WHERE id = ?")
    .bind(status)
    .bind(id)
    .execute(db)
    .await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{DbClient, deployments};

  #[tokio::test]
  async fn run_numbers_start_at_one_per_project() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let project =
      crate::projects::create(pool, "api", None, None, None)
        .await
        .unwrap();
    let mut conn = pool.acquire().await.unwrap();
    let deployment = deployments::create(
      &mut conn,
      deployments::NewDeployment {
        project: &project,
        commit_hash: None,
        disco_file: None,
        registry_host: None,
        domain: None,
        by_api_key_id: None,
        env_variables: vec![],
      },
    )
    .await
    .unwrap();
    let first = create(
      &mut conn,
      &project.id,
      &deployment.id,
      "web",
      "ls",
      "key",
    )
    .await
    .unwrap();
    let second = create(
      &mut conn,
      &project.id,
      &deployment.id,
      "web",
      "env",
      "key",
    )
    .await
    .unwrap();
    assert_eq!(first.number, 1);
    assert_eq!(second.number, 2);
  }
}
