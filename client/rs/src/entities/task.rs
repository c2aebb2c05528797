use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// A queued unit of background work, consumed FIFO by the worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct Task {
  pub id: String,
  pub name: TaskName,
  pub status: TaskStatus,
  /// Handler input as JSON.
  pub body: String,
  pub result: Option<String>,
  pub created: DateTime<Utc>,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Hash,
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
pub enum TaskName {
  ProcessDeployment,
  ProcessGithubWebhook,
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
pub enum TaskStatus {
  #[default]
  Queued,
  Processing,
  Completed,
  Failed,
}

impl TaskStatus {
  pub fn is_terminal(self) -> bool {
    matches!(self, TaskStatus::Completed | TaskStatus::Failed)
  }
}

/// Body of a [TaskName::ProcessDeployment] task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDeploymentBody {
  pub deployment_id: String,
}

/// Body of a [TaskName::ProcessGithubWebhook] task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessGithubWebhookBody {
  pub app_id: i64,
  pub event: String,
  pub request_body: String,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn task_names_round_trip() {
    for name in
      [TaskName::ProcessDeployment, TaskName::ProcessGithubWebhook]
    {
      assert_eq!(
        name.to_string().parse::<TaskName>().unwrap(),
        name
      );
    }
    assert_eq!(
      TaskName::ProcessDeployment.to_string(),
      "PROCESS_DEPLOYMENT"
    );
  }
}
