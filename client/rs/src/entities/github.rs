use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A GitHub App registered with Disco. Webhook deliveries are
/// authenticated against `webhook_secret`; `pem` signs the app JWTs
/// used to mint installation access tokens. Both are stored encrypted.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct GithubApp {
  /// The app id assigned by GitHub.
  pub id: i64,
  pub slug: String,
  pub name: String,
  pub owner_id: i64,
  pub owner_login: String,
  pub owner_type: String,
  pub webhook_secret: String,
  pub pem: String,
  pub client_secret: String,
  pub html_url: String,
  pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct GithubAppInstallation {
  pub id: i64,
  pub github_app_id: i64,
  pub created: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct GithubAppRepo {
  pub id: String,
  pub installation_id: i64,
  /// `owner/repo`.
  pub full_name: String,
  pub created: DateTime<Utc>,
}

/// In-flight app registration, waiting for the GitHub manifest
/// conversion callback. Expires after 30 minutes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct PendingGithubApp {
  pub id: String,
  pub state: String,
  pub organization: Option<String>,
  pub expires: DateTime<Utc>,
  pub created: DateTime<Utc>,
}
