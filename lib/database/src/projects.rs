use disco_client::entities::{
  disco_timestamp, new_id, project::Project,
};
use sqlx::SqliteExecutor;

pub async fn create(
  db: impl SqliteExecutor<'_>,
  name: &str,
  github_repo: Option<&str>,
  branch: Option<&str>,
  github_installation_id: Option<i64>,
) -> anyhow::Result<Project> {
  let project = Project {
    id: new_id(),
    name: name.to_string(),
    webhook_token: Some(new_id()),
    github_repo: github_repo.map(str::to_string),
    branch: branch.map(str::to_string),
    github_installation_id,
    created: disco_timestamp(),
  };
  sqlx::query(
    "INSERT INTO projects \
     (id, name, webhook_token, github_repo, branch, \
      github_installation_id, created) \
     VALUES (?, ?, ?, ?, ?, ?, ?)",
  )
  .bind(&project.id)
  .bind(&project.name)
  .bind(&project.webhook_token)
  .bind(&project.github_repo)
  .bind(&project.branch)
  .bind(project.github_installation_id)
  .bind(project.created)
  .execute(db)
  .await?;
  info!("created {}", project.log());
  Ok(project)
}

pub async fn get_by_id(
  db: impl SqliteExecutor<'_>,
  id: &str,
) -> anyhow::Result<Option<Project>> {
  let project =
    sqlx::query_as("SELECT * FROM projects WHERE id = ?")
      .bind(id)
      .fetch_optional(db)
      .await?;
  Ok(project)
}

pub async fn get_by_name(
  db: impl SqliteExecutor<'_>,
  name: &str,
) -> anyhow::Result<Option<Project>> {
  let project =
    sqlx::query_as("SELECT * FROM projects WHERE name = ?")
      .bind(name)
      .fetch_optional(db)
      .await?;
  Ok(project)
}

pub async fn get_all(
  db: impl SqliteExecutor<'_>,
) -> anyhow::Result<Vec<Project>> {
  let projects =
    sqlx::query_as("SELECT * FROM projects ORDER BY name")
      .fetch_all(db)
      .await?;
  Ok(projects)
}

/// The project bound to a GitHub repo through any installation.
pub async fn get_by_github_repo(
  db: impl SqliteExecutor<'_>,
  full_name: &str,
) -> anyhow::Result<Option<Project>> {
  let project = sqlx::query_as(
    "SELECT * FROM projects WHERE github_repo = ? LIMIT 1",
  )
  .bind(full_name)
  .fetch_optional(db)
  .await?;
  Ok(project)
}

pub async fn delete(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
) -> anyhow::Result<()> {
  sqlx::query("DELETE FROM projects WHERE id = ?")
    .bind(project_id)
    .execute(db)
    .await?;
  Ok(())
}
