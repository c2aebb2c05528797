use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The logical unit of deployment: a name, an optional source repo
/// binding and a history of deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Project {
  pub id: String,
  pub name: String,
  /// Token distributed to webhook callers, when push-to-deploy is
  /// routed through the legacy per-project webhook.
  pub webhook_token: Option<String>,
  /// `owner/repo` of the bound repository.
  pub github_repo: Option<String>,
  /// Branch deployed by `_DEPLOY_LATEST_`. When unset the checkout
  /// falls back to `main`, then `master`.
  pub branch: Option<String>,
  pub github_installation_id: Option<i64>,
  pub created: DateTime<Utc>,
}

impl Project {
  pub fn log(&self) -> String {
    format!("project {} ({})", self.name, self.id)
  }
}

/// An encrypted project environment variable.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ProjectEnvVar {
  pub id: String,
  pub project_id: String,
  pub name: String,
  /// AEAD ciphertext, decrypted only when handed to containers.
  pub value: String,
  pub by_api_key_id: Option<String>,
  pub created: DateTime<Utc>,
}

/// Encrypted per-project key value setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ProjectKeyValue {
  pub project_id: String,
  pub key: String,
  pub value: Option<String>,
  pub created: DateTime<Utc>,
}

/// Swarm volume names are scoped by project id so projects cannot
/// collide on a manifest volume name.
pub fn volume_name_for_project(
  volume: &str,
  project_id: &str,
) -> String {
  format!("disco-project-{project_id}-{volume}")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn volume_names_are_scoped() {
    assert_eq!(
      volume_name_for_project("data", "abc123"),
      "disco-project-abc123-data"
    );
  }
}
