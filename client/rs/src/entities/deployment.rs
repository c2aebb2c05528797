use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// An immutable snapshot of one attempt to run a project.
///
/// `number` starts at 1 and increases strictly per project. The manifest
/// bytes and commit hash are frozen once the deployment leaves
/// [DeploymentStatus::Queued]. Deployments are never deleted; "live" is
/// derived as the newest [DeploymentStatus::Complete] per project.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Deployment {
  pub id: String,
  pub project_id: String,
  pub number: i64,
  pub status: DeploymentStatus,
  pub commit_hash: Option<String>,
  /// Captured `disco.json` bytes, persisted once resolved.
  pub disco_file: Option<String>,
  /// Denormalized so the pipeline can keep running if the project
  /// is renamed mid-flight.
  pub project_name: String,
  pub registry_host: Option<String>,
  pub domain: Option<String>,
  pub github_repo: Option<String>,
  pub branch: Option<String>,
  pub prev_deployment_id: Option<String>,
  pub by_api_key_id: Option<String>,
  pub task_id: Option<String>,
  pub created: DateTime<Utc>,
}

/// Commit placeholder meaning "HEAD of the configured branch at
/// checkout time".
pub const DEPLOY_LATEST: &str = "_DEPLOY_LATEST_";

#[derive(
  Debug,
  Clone,
  Copy,
  Default,
  PartialEq,
  Eq,
  Display,
  EnumString,
  Serialize,
  Deserialize,
)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(
  feature = "sqlx",
  sqlx(rename_all = "SCREAMING_SNAKE_CASE")
)]
pub enum DeploymentStatus {
  #[default]
  Queued,
  InProgress,
  Complete,
  Failed,
}

impl DeploymentStatus {
  /// Terminal states never transition again.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      DeploymentStatus::Complete | DeploymentStatus::Failed
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn status_strings_match_store_format() {
    assert_eq!(DeploymentStatus::Queued.to_string(), "QUEUED");
    assert_eq!(
      DeploymentStatus::InProgress.to_string(),
      "IN_PROGRESS"
    );
    assert_eq!(
      "COMPLETE".parse::<DeploymentStatus>().unwrap(),
      DeploymentStatus::Complete
    );
  }

  #[test]
  fn terminal_states() {
    assert!(!DeploymentStatus::Queued.is_terminal());
    assert!(!DeploymentStatus::InProgress.is_terminal());
    assert!(DeploymentStatus::Complete.is_terminal());
    assert!(DeploymentStatus::Failed.is_terminal());
  }
}
