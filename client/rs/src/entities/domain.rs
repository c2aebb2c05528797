use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A domain routed to a project. Names are globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
pub struct ProjectDomain {
  pub id: String,
  pub name: String,
  pub project_id: String,
  pub created: DateTime<Utc>,
}

impl ProjectDomain {
  pub fn log(&self) -> String {
    format!("domain {} ({})", self.name, self.id)
  }
}

/// The apex⇄www counterpart a domain may auto-redirect from.
///
/// `example.com` pairs with `www.example.com` and vice versa.
/// Deeper subdomains have no counterpart.
pub fn apex_www_counterpart(domain: &str) -> Option<String> {
  let parts: Vec<&str> = domain.split('.').collect();
  match parts.as_slice() {
    [_, _] => Some(format!("www.{domain}")),
    ["www", rest @ ..] if rest.len() == 2 => Some(rest.join(".")),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn apex_pairs_with_www() {
    assert_eq!(
      apex_www_counterpart("example.com").as_deref(),
      Some("www.example.com")
    );
    assert_eq!(
      apex_www_counterpart("www.example.com").as_deref(),
      Some("example.com")
    );
  }

  #[test]
  fn subdomains_have_no_counterpart() {
    assert_eq!(apex_www_counterpart("blog.example.com"), None);
    assert_eq!(apex_www_counterpart("a.blog.example.com"), None);
    assert_eq!(apex_www_counterpart("www.blog.example.com"), None);
  }
}
