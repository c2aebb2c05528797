use serde::{Deserialize, Serialize};
use strum::Display;

/// One syslog destination stored in the `SYSLOG_URLS` key value
/// (a JSON array of these).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyslogUrl {
  /// `syslog://host:port` or `syslog+tls://host:port`.
  pub url: String,
  #[serde(rename = "type")]
  pub url_type: SyslogUrlType,
}

#[derive(
  Debug,
  Clone,
  Copy,
  PartialEq,
  Eq,
  Display,
  Serialize,
  Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SyslogUrlType {
  /// Appended at provisioning; only captures containers labeled
  /// `disco.log.core=true`.
  Core,
  /// Managed by the operator, captures everything.
  Global,
}

impl SyslogUrl {
  /// The URL handed to logspout. Core destinations are narrowed to
  /// core-labeled containers.
  pub fn logspout_url(&self) -> String {
    match self.url_type {
      SyslogUrlType::Core => {
        format!("{}?filter.labels=disco.log.core:true", self.url)
      }
      SyslogUrlType::Global => self.url.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn core_urls_are_filtered() {
    let url = SyslogUrl {
      url: "syslog+tls://logs.example.com:6514".to_string(),
      url_type: SyslogUrlType::Core,
    };
    assert_eq!(
      url.logspout_url(),
      "syslog+tls://logs.example.com:6514?filter.labels=disco.log.core:true"
    );
    let url = SyslogUrl {
      url_type: SyslogUrlType::Global,
      ..url
    };
    assert_eq!(
      url.logspout_url(),
      "syslog+tls://logs.example.com:6514"
    );
  }

  #[test]
  fn serializes_with_wire_field_names() {
    let url = SyslogUrl {
      url: "syslog://h:514".into(),
      url_type: SyslogUrlType::Global,
    };
    assert_eq!(
      serde_json::to_string(&url).unwrap(),
      r#"{"url":"syslog://h:514","type":"GLOBAL"}"#
    );
  }
}
