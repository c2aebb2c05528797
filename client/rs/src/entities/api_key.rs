use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::entities::obfuscate;

/// Operator credential. The id is the secret itself; `public_key` is
/// the non-secret identifier used in logs and as the JWT `kid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ApiKey {
  pub id: String,
  pub name: String,
  pub public_key: String,
  /// Soft delete timestamp. The store refuses to delete the last
  /// remaining live key.
  pub deleted: Option<DateTime<Utc>>,
  pub created: DateTime<Utc>,
}

impl ApiKey {
  pub fn log(&self) -> String {
    format!("api key {} ({})", self.name, obfuscate(&self.id))
  }
}

/// Single-use invitation that mints an [ApiKey] when consumed.
/// Expires at most 24 hours after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ApiKeyInvite {
  pub id: String,
  pub name: String,
  pub expires: DateTime<Utc>,
  pub by_api_key_id: String,
  pub created: DateTime<Utc>,
}

impl ApiKeyInvite {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires <= now
  }
}

/// Append-only usage record, kept with bounded retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ApiKeyUsage {
  pub id: String,
  pub api_key_id: String,
  pub created: DateTime<Utc>,
}
