use disco_client::entities::{
  disco_timestamp, domain::ProjectDomain, new_id,
};
use sqlx::SqliteExecutor;

/// Insert a domain. The unique index on `name` turns a taken domain
/// into a constraint error the caller maps to Conflict.
pub async fn create(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
  name: &str,
) -> anyhow::Result<ProjectDomain> {
  let domain = ProjectDomain {
    id: new_id(),
    name: name.to_string(),
    project_id: project_id.to_string(),
    created: disco_timestamp(),
  };
  sqlx::query(
    "INSERT INTO project_domains (id, name, project_id, created) \
     VALUES (?, ?, ?, ?)",
  )
  .bind(&domain.id)
  .bind(&domain.name)
  .bind(&domain.project_id)
  .bind(domain.created)
  .execute(db)
  .await?;
  Ok(domain)
}

pub async fn get_by_name(
  db: impl SqliteExecutor<'_>,
  name: &str,
) -> anyhow::Result<Option<ProjectDomain>> {
  let domain = sqlx::query_as(
    "SELECT * FROM project_domains WHERE name = ?",
  )
  .bind(name)
  .fetch_optional(db)
  .await?;
  Ok(domain)
}

pub async fn get_by_id(
  db: impl SqliteExecutor<'_>,
  id: &str,
) -> anyhow::Result<Option<ProjectDomain>> {
  let domain =
    sqlx::query_as("SELECT * FROM project_domains WHERE id = ?")
      .bind(id)
      .fetch_optional(db)
      .await?;
  Ok(domain)
}

pub async fn get_for_project(
  db: impl SqliteExecutor<'_>,
  project_id: &str,
) -> anyhow::Result<Vec<ProjectDomain>> {
  let domains = sqlx::query_as(
    "SELECT * FROM project_domains \
     WHERE project_id = ? ORDER BY created",
  )
  .bind(project_id)
  .fetch_all(db)
  .await?;
  Ok(domains)
}

pub async fn delete(
  db: impl SqliteExecutor<'_>,
  id: &str,
) -> anyhow::Result<()> {
  sqlx::query("DELETE FROM project_domains WHERE id = ?")
    .bind(id)
    .execute(db)
    .await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::DbClient;

  #[tokio::test]
  async fn domain_names_are_unique() {
    let client = DbClient::new_in_memory().await.unwrap();
    let pool = &client.pool;
    let blog =
      crate::projects::create(pool, "blog", None, None, None)
        .await
        .unwrap();
    let docs =
      crate::projects::create(pool, "docs", None, None, None)
        .await
        .unwrap();
    create(pool, &blog.id, "blog.example.com").await.unwrap();
    assert!(
      create(pool, &docs.id, "blog.example.com").await.is_err()
    );
  }
}
