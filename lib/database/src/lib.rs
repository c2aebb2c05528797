//! Primary store access for the Disco daemon and worker.
//!
//! The schema is created on connect; there is no separate migration
//! step for a fresh database (upgrades are handled by the install
//! tooling, outside this crate). All tables live in one SQLite
//! database except command outputs, which get one file per source
//! under `/disco/data/commandoutputs/` (see [outputs]).

#[macro_use]
extern crate tracing;

use std::{path::Path, str::FromStr};

use anyhow::Context;
use sqlx::{
  SqlitePool,
  sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};

pub mod api_keys;
pub mod command_runs;
pub mod cors_origins;
pub mod deployments;
pub mod domains;
pub mod env_variables;
pub mod github_apps;
pub mod key_values;
pub mod outputs;
pub mod project_key_values;
pub mod projects;
pub mod tasks;

pub use sqlx;

#[derive(Debug, Clone)]
pub struct DbClient {
  pub pool: SqlitePool,
}

impl DbClient {
  pub async fn new(path: &Path) -> anyhow::Result<DbClient> {
    if let Some(parent) = path.parent() {
      tokio::fs::create_dir_all(parent).await.with_context(
        || format!("failed to create database directory {parent:?}"),
      )?;
    }
    let options = SqliteConnectOptions::from_str(&format!(
      "sqlite://{}",
      path.display()
    ))
    .context("invalid database path")?
    .create_if_missing(true)
    .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
    .busy_timeout(std::time::Duration::from_secs(5));
    let pool = SqlitePoolOptions::new()
      .connect_with(options)
      .await
      .context("failed to connect to database")?;
    let client = DbClient { pool };
    client.init_schema().await?;
    Ok(client)
  }

  pub async fn new_in_memory() -> anyhow::Result<DbClient> {
    // every pooled connection to :memory: is its own database, so
    // the pool must stay at one connection
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect("sqlite::memory:")
      .await
      .context("failed to open in-memory database")?;
    let client = DbClient { pool };
    client.init_schema().await?;
    Ok(client)
  }

  async fn init_schema(&self) -> anyhow::Result<()> {
    sqlx::raw_sql(SCHEMA)
      .execute(&self.pool)
      .await
      .context("failed to initialize database schema")?;
    Ok(())
  }
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS projects (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  webhook_token TEXT,
  github_repo TEXT,
  branch TEXT,
  github_installation_id INTEGER,
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS project_env_variables (
  id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL REFERENCES projects (id),
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  by_api_key_id TEXT,
  created TEXT NOT NULL,
  UNIQUE (project_id, name)
);

CREATE TABLE IF NOT EXISTS project_key_values (
  project_id TEXT NOT NULL REFERENCES projects (id),
  key TEXT NOT NULL,
  value TEXT,
  created TEXT NOT NULL,
  PRIMARY KEY (project_id, key)
);

-- no FK to projects: deployment history outlives project deletion
CREATE TABLE IF NOT EXISTS deployments (
  id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL,
  number INTEGER NOT NULL,
  status TEXT NOT NULL,
  commit_hash TEXT,
  disco_file TEXT,
  project_name TEXT NOT NULL,
  registry_host TEXT,
  domain TEXT,
  github_repo TEXT,
  branch TEXT,
  prev_deployment_id TEXT,
  by_api_key_id TEXT,
  task_id TEXT,
  created TEXT NOT NULL,
  UNIQUE (project_id, number)
);

CREATE TABLE IF NOT EXISTS deployment_env_variables (
  id TEXT PRIMARY KEY,
  deployment_id TEXT NOT NULL REFERENCES deployments (id),
  name TEXT NOT NULL,
  value TEXT NOT NULL,
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS project_domains (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL UNIQUE,
  project_id TEXT NOT NULL REFERENCES projects (id),
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_keys (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  public_key TEXT NOT NULL,
  deleted TEXT,
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_key_invites (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  expires TEXT NOT NULL,
  by_api_key_id TEXT NOT NULL,
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS api_key_usages (
  id TEXT PRIMARY KEY,
  api_key_id TEXT NOT NULL REFERENCES api_keys (id),
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  status TEXT NOT NULL,
  body TEXT NOT NULL,
  result TEXT,
  created TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS ix_tasks_status_created
  ON tasks (status, created);

CREATE TABLE IF NOT EXISTS key_values (
  key TEXT PRIMARY KEY,
  value TEXT
);

CREATE TABLE IF NOT EXISTS command_runs (
  id TEXT PRIMARY KEY,
  project_id TEXT NOT NULL,
  number INTEGER NOT NULL,
  service TEXT NOT NULL,
  command TEXT NOT NULL,
  status TEXT NOT NULL,
  deployment_id TEXT NOT NULL REFERENCES deployments (id),
  by_api_key_id TEXT NOT NULL,
  created TEXT NOT NULL,
  UNIQUE (project_id, number)
);

CREATE TABLE IF NOT EXISTS cors_origins (
  id TEXT PRIMARY KEY,
  origin TEXT NOT NULL UNIQUE,
  by_api_key_id TEXT,
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS github_apps (
  id INTEGER PRIMARY KEY,
  slug TEXT NOT NULL,
  name TEXT NOT NULL,
  owner_id INTEGER NOT NULL,
  owner_login TEXT NOT NULL,
  owner_type TEXT NOT NULL,
  webhook_secret TEXT NOT NULL,
  pem TEXT NOT NULL,
  client_secret TEXT NOT NULL,
  html_url TEXT NOT NULL,
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS github_app_installations (
  id INTEGER PRIMARY KEY,
  github_app_id INTEGER NOT NULL REFERENCES github_apps (id),
  created TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS github_app_repos (
  id TEXT PRIMARY KEY,
  installation_id INTEGER NOT NULL
    REFERENCES github_app_installations (id),
  full_name TEXT NOT NULL,
  created TEXT NOT NULL,
  UNIQUE (installation_id, full_name)
);

CREATE TABLE IF NOT EXISTS pending_github_apps (
  id TEXT PRIMARY KEY,
  state TEXT NOT NULL,
  organization TEXT,
  expires TEXT NOT NULL,
  created TEXT NOT NULL
);
";

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn schema_initializes_twice() {
    let client = DbClient::new_in_memory().await.unwrap();
    // CREATE TABLE IF NOT EXISTS makes re-init a no-op
    client.init_schema().await.unwrap();
  }

  #[tokio::test]
  async fn opens_on_disk_database() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("data/disco.sqlite3");
    let client = DbClient::new(&path).await.unwrap();
    sqlx::query("SELECT COUNT(*) FROM projects")
      .fetch_one(&client.pool)
      .await
      .unwrap();
    assert!(path.exists());
  }
}
