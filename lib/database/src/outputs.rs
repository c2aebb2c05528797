//! Per-source output streams (`deployment_<id>`, `run_<id>`).
//!
//! Each source gets its own SQLite file under the outputs directory
//! so the hot append path never contends with the primary store.
//! Connections open lazily on first use and are disposed after six
//! idle hours by the scheduler's hour tick.

use std::{collections::HashMap, path::PathBuf, str::FromStr};

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use disco_client::entities::{disco_timestamp, new_id};
use sqlx::{
  SqlitePool,
  sqlite::{SqliteConnectOptions, SqlitePoolOptions},
};
use tokio::sync::Mutex;

pub const IDLE_EVICTION: Duration = Duration::hours(6);

/// One row of a source stream. `text: None` is the termination
/// sentinel appended when the producing task ends.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct Output {
  pub id: String,
  pub created: DateTime<Utc>,
  pub text: Option<String>,
}

struct SourceDb {
  pool: SqlitePool,
  last_used: DateTime<Utc>,
}

pub struct OutputStores {
  dir: PathBuf,
  dbs: Mutex<HashMap<String, SourceDb>>,
}

pub fn deployment_source(deployment_id: &str) -> String {
  format!("deployment_{deployment_id}")
}

pub fn run_source(run_id: &str) -> String {
  format!("run_{run_id}")
}

impl OutputStores {
  pub fn new(dir: impl Into<PathBuf>) -> OutputStores {
    OutputStores {
      dir: dir.into(),
      dbs: Mutex::new(HashMap::new()),
    }
  }

  fn file_path(&self, source: &str) -> PathBuf {
    self.dir.join(format!("{source}.sqlite3"))
  }

  async fn pool(&self, source: &str) -> anyhow::Result<SqlitePool> {
    let mut dbs = self.dbs.lock().await;
    if let Some(db) = dbs.get_mut(source) {
      db.last_used = Utc::now();
      return Ok(db.pool.clone());
    }
    tokio::fs::create_dir_all(&self.dir).await.with_context(
      || format!("failed to create outputs dir {:?}", self.dir),
    )?;
    let path = self.file_path(source);
    let options = SqliteConnectOptions::from_str(&format!(
      "sqlite://{}",
      path.display()
    ))
    .context("invalid output store path")?
    .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
      .max_connections(1)
      .connect_with(options)
      .await
      .with_context(|| {
        format!("failed to open output store for {source}")
      })?;
    sqlx::raw_sql(
      "CREATE TABLE IF NOT EXISTS command_outputs (
         id TEXT PRIMARY KEY,
         created TEXT NOT NULL,
         text TEXT
       );
       CREATE INDEX IF NOT EXISTS ix_command_outputs_created
         ON command_outputs (created);",
    )
    .execute(&pool)
    .await
    .context("failed to initialize output store schema")?;
    dbs.insert(
      source.to_string(),
      SourceDb {
        pool: pool.clone(),
        last_used: Utc::now(),
      },
    );
    Ok(pool)
  }

  pub async fn store_output(
    &self,
    source: &str,
    text: &str,
  ) -> anyhow::Result<()> {
    self.append(source, Some(text)).await
  }

  /// Append the null sentinel so followers know the stream ended.
  pub async fn terminate(&self, source: &str) -> anyhow::Result<()> {
    self.append(source, None).await
  }

  async fn append(
    &self,
    source: &str,
    text: Option<&str>,
  ) -> anyhow::Result<()> {
    let pool = self.pool(source).await?;
    sqlx::query(
      "INSERT INTO command_outputs (id, created, text) \
       VALUES (?, ?, ?)",
    )
    .bind(new_id())
    .bind(disco_timestamp())
    .bind(text)
    .execute(&pool)
    .await?;
    Ok(())
  }

  /// The next output strictly after `after` (or the first one),
  /// in created order. Followers poll this to tail a stream.
  pub async fn get_next(
    &self,
    source: &str,
    after: Option<DateTime<Utc>>,
  ) -> anyhow::Result<Option<Output>> {
    let pool = self.pool(source).await?;
    let output = match after {
      Some(after) => {
        sqlx::query_as(
          "SELECT * FROM command_outputs WHERE created > ? \
           ORDER BY created ASC LIMIT 1",
        )
        .bind(after)
        .fetch_optional(&pool)
        .await?
      }
      None => {
        sqlx::query_as(
          "SELECT * FROM command_outputs \
           ORDER BY created ASC LIMIT 1",
        )
        .fetch_optional(&pool)
        .await?
      }
    };
    Ok(output)
  }

  /// Remove a source's file entirely (project deletion).
  pub async fn delete_source(
    &self,
    source: &str,
  ) -> anyhow::Result<()> {
    if let Some(db) = self.dbs.lock().await.remove(source) {
      db.pool.close().await;
    }
    match tokio::fs::remove_file(self.file_path(source)).await {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  /// Close connections unused for [IDLE_EVICTION]. Called from the
  /// scheduler's hour tick.
  pub async fn evict_idle(&self) {
    let cutoff = Utc::now() - IDLE_EVICTION;
    let mut dbs = self.dbs.lock().await;
    let idle: Vec<String> = dbs
      .iter()
      .filter(|(_, db)| db.last_used < cutoff)
      .map(|(source, _)| source.clone())
      .collect();
    for source in idle {
      if let Some(db) = dbs.remove(&source) {
        info!("disposing idle output store for {source}");
        db.pool.close().await;
      }
    }
  }

  #[cfg(test)]
  async fn open_count(&self) -> usize {
    self.dbs.lock().await.len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn streams_append_in_order_and_terminate() {
    let dir = tempfile::tempdir().unwrap();
    let stores = OutputStores::new(dir.path());
    let source = deployment_source("abc");
    stores.store_output(&source, "Starting deployment\n")
      .await
      .unwrap();
    stores.store_output(&source, "Building images\n")
      .await
      .unwrap();
    stores.terminate(&source).await.unwrap();

    let first = stores.get_next(&source, None).await.unwrap().unwrap();
    assert_eq!(first.text.as_deref(), Some("Starting deployment\n"));
    let second = stores
      .get_next(&source, Some(first.created))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(second.text.as_deref(), Some("Building images\n"));
    let sentinel = stores
      .get_next(&source, Some(second.created))
      .await
      .unwrap()
      .unwrap();
    assert_eq!(sentinel.text, None);
    assert!(
      stores
        .get_next(&source, Some(sentinel.created))
        .await
        .unwrap()
        .is_none()
    );
  }

  #[tokio::test]
  async fn sources_are_isolated_files() {
    let dir = tempfile::tempdir().unwrap();
    let stores = OutputStores::new(dir.path());
    stores
      .store_output(&run_source("r1"), "one")
      .await
      .unwrap();
    stores
      .store_output(&run_source("r2"), "two")
      .await
      .unwrap();
    assert!(dir.path().join("run_r1.sqlite3").exists());
    assert!(dir.path().join("run_r2.sqlite3").exists());
    let next = stores
      .get_next(&run_source("r1"), None)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(next.text.as_deref(), Some("one"));
  }

  #[tokio::test]
  async fn delete_source_removes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let stores = OutputStores::new(dir.path());
    let source = run_source("gone");
    stores.store_output(&source, "x").await.unwrap();
    stores.delete_source(&source).await.unwrap();
    assert!(!dir.path().join("run_gone.sqlite3").exists());
    // deleting again is fine
    stores.delete_source(&source).await.unwrap();
  }

  #[tokio::test]
  async fn eviction_only_drops_idle_connections() {
    let dir = tempfile::tempdir().unwrap();
    let stores = OutputStores::new(dir.path());
    stores.store_output("fresh", "x").await.unwrap();
    stores.evict_idle().await;
    assert_eq!(stores.open_count().await, 1);
    // age the connection artificially
    stores
      .dbs
      .lock()
      .await
      .get_mut("fresh")
      .unwrap()
      .last_used = Utc::now() - Duration::hours(7);
    stores.evict_idle().await;
    assert_eq!(stores.open_count().await, 0);
    // the data survives reopening
    let next = stores.get_next("fresh", None).await.unwrap().unwrap();
    assert_eq!(next.text.as_deref(), Some("x"));
  }
}
