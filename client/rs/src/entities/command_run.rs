use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// One ephemeral command execution against a live deployment.
/// `number` is scoped per project, starting at 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct CommandRun {
  pub id: String,
  pub project_id: String,
  pub number: i64,
  pub service: String,
  pub command: String,
  pub status: CommandRunStatus,
  pub deployment_id: String,
  pub by_api_key_id: String,
  pub created: DateTime<Utc>,
}

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
pub enum CommandRunStatus {
  #[default]
  Created,
  Started,
  Done,
  Failed,
}
