use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Subtypes of [ApiKey][api_key::ApiKey].
pub mod api_key;
/// Subtypes of [CommandRun][command_run::CommandRun].
pub mod command_run;
/// Subtypes of [Deployment][deployment::Deployment].
pub mod deployment;
/// [ProjectDomain][domain::ProjectDomain].
pub mod domain;
/// GitHub App records backing the webhook intake.
pub mod github;
/// Subtypes of [LogConfig][logger::LogConfig].
pub mod logger;
/// The `disco.json` manifest model.
pub mod manifest;
/// Subtypes of [Project][project::Project].
pub mod project;
/// Syslog destination entries stored under the `SYSLOG_URLS` key value.
pub mod syslog;
/// Subtypes of [Task][task::Task].
pub mod task;

/// Current UTC time, truncated to microseconds so values survive a
/// round-trip through the store unchanged.
pub fn disco_timestamp() -> DateTime<Utc> {
  let now = Utc::now();
  now - chrono::Duration::nanoseconds(now.timestamp_subsec_nanos() as i64 % 1_000)
}

/// Random 128-bit hex id, the id format of every entity.
pub fn new_id() -> String {
  uuid::Uuid::new_v4().simple().to_string()
}

pub fn optional_string(string: impl Into<String>) -> Option<String> {
  let string = string.into();
  if string.is_empty() { None } else { Some(string) }
}

/// A name / value pair, used both for project env variables
/// (value encrypted) and for the env handed to containers (value plain).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
  pub name: String,
  pub value: String,
}

impl EnvVar {
  pub fn new(name: impl Into<String>, value: impl Into<String>) -> EnvVar {
    EnvVar {
      name: name.into(),
      value: value.into(),
    }
  }
}

/// Mask a secret for log output, keeping only the edges visible.
pub fn obfuscate(string: &str) -> String {
  if string.len() < 5 {
    return "*".repeat(string.len());
  }
  format!(
    "{}{}{}",
    &string[..3],
    "*".repeat(string.len() - 4),
    &string[string.len() - 1..]
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn new_ids_are_hex_and_unique() {
    let a = new_id();
    let b = new_id();
    assert_eq!(a.len(), 32);
    assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    assert_ne!(a, b);
  }

  #[test]
  fn obfuscate_keeps_edges() {
    assert_eq!(obfuscate("supersecretvalue"), "sup***********e");
    assert_eq!(obfuscate("abcd"), "****");
  }
}
