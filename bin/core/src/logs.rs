//! Global log aggregation: logspout sends each container log line
//! as a JSON datagram over UDP; the hub decodes them and fans them
//! out on a broadcast channel. Followers (SSE/WS bindings) filter
//! by project and service labels.

use serde::{Deserialize, Serialize};
use tokio::{net::UdpSocket, sync::broadcast};

use crate::{config::core_config, docker};

/// One decoded logspout datagram.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
  pub container: String,
  #[serde(default)]
  pub labels: serde_json::Map<String, serde_json::Value>,
  pub timestamp: String,
  pub message: String,
}

impl LogEntry {
  fn label(&self, name: &str) -> Option<&str> {
    self.labels.get(name).and_then(|value| value.as_str())
  }

  pub fn project_name(&self) -> Option<&str> {
    self.label(docker::PROJECT_LABEL)
  }

  pub fn service_name(&self) -> Option<&str> {
    self.label(docker::SERVICE_LABEL)
  }

  /// Whether this entry matches an optional project/service
  /// filter.
  pub fn matches(
    &self,
    project_name: Option<&str>,
    service_name: Option<&str>,
  ) -> bool {
    if let Some(project) = project_name
      && self.project_name() != Some(project)
    {
      return false;
    }
    if let Some(service) = service_name
      && self.service_name() != Some(service)
    {
      return false;
    }
    true
  }
}

pub struct LogsHub {
  sender: broadcast::Sender<LogEntry>,
}

impl Default for LogsHub {
  fn default() -> LogsHub {
    let (sender, _) = broadcast::channel(4096);
    LogsHub { sender }
  }
}

impl LogsHub {
  pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
    self.sender.subscribe()
  }

  /// Bind the UDP socket and pump datagrams until the process
  /// exits. Undecodable datagrams are logged and dropped.
  pub async fn run(&self) {
    let port = core_config().log_udp_port;
    let socket = match UdpSocket::bind(("0.0.0.0", port)).await {
      Ok(socket) => socket,
      Err(e) => {
        error!("failed to bind log socket on {port} | {e}");
        return;
      }
    };
    info!("log aggregator listening on udp {port}");
    let mut buf = vec![0u8; 65536];
    loop {
      let len = match socket.recv(&mut buf).await {
        Ok(len) => len,
        Err(e) => {
          warn!("log socket receive failed | {e}");
          continue;
        }
      };
      let datagram = &buf[..len];
      let text = match std::str::from_utf8(datagram) {
        Ok(text) => text,
        Err(_) => {
          error!("failed to UTF-8 decode log datagram");
          continue;
        }
      };
      match serde_json::from_str::<LogEntry>(text) {
        Ok(entry) => {
          // no subscribers is fine, entries just drop
          let _ = self.sender.send(entry);
        }
        Err(e) => {
          error!("failed to JSON decode log datagram | {e}");
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn entry(project: &str, service: &str) -> LogEntry {
    serde_json::from_str(&format!(
      r#"{{
        "container": "{project}-{service}.1",
        "labels": {{
          "disco.project.name": "{project}",
          "disco.service.name": "{service}"
        }},
        "timestamp": "2024-01-15T10:30:00Z",
        "message": "listening on :8000"
      }}"#,
    ))
    .unwrap()
  }

  #[test]
  fn decodes_logspout_datagrams() {
    let entry = entry("api", "web");
    assert_eq!(entry.project_name(), Some("api"));
    assert_eq!(entry.service_name(), Some("web"));
    assert_eq!(entry.message, "listening on :8000");
  }

  #[test]
  fn filtering_by_project_and_service() {
    let log = entry("api", "web");
    assert!(log.matches(None, None));
    assert!(log.matches(Some("api"), None));
    assert!(log.matches(Some("api"), Some("web")));
    assert!(!log.matches(Some("blog"), None));
    assert!(!log.matches(Some("api"), Some("worker")));
  }

  #[tokio::test]
  async fn hub_fans_out_to_subscribers() {
    let hub = LogsHub::default();
    let mut a = hub.subscribe();
    let mut b = hub.subscribe();
    hub.sender.send(entry("api", "web")).unwrap();
    assert_eq!(a.recv().await.unwrap().message, "listening on :8000");
    assert_eq!(b.recv().await.unwrap().message, "listening on :8000");
  }
}
