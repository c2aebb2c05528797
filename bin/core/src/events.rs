//! In-process API event feed: a bounded ring of recent events with
//! broadcast fan-out. The SSE binding replays the ring to new
//! subscribers (filtered by `Last-Event-ID`), then follows the
//! channel. Events older than an hour are dropped on every append.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use disco_client::entities::new_id;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

const RETENTION: Duration = Duration::hours(1);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiEvent {
  pub id: String,
  pub created: DateTime<Utc>,
  pub kind: String,
  pub data: serde_json::Value,
}

pub struct EventsHub {
  events: std::sync::Mutex<VecDeque<ApiEvent>>,
  sender: broadcast::Sender<ApiEvent>,
}

impl Default for EventsHub {
  fn default() -> EventsHub {
    let (sender, _) = broadcast::channel(1024);
    EventsHub {
      events: std::sync::Mutex::new(VecDeque::new()),
      sender,
    }
  }
}

impl EventsHub {
  pub fn publish(
    &self,
    kind: impl Into<String>,
    data: serde_json::Value,
  ) {
    let event = ApiEvent {
      id: new_id(),
      created: Utc::now(),
      kind: kind.into(),
      data,
    };
    {
      let mut events = self.events.lock().unwrap();
      let cutoff = Utc::now() - RETENTION;
      while events
        .front()
        .is_some_and(|event| event.created < cutoff)
      {
        events.pop_front();
      }
      events.push_back(event.clone());
    }
    let _ = self.sender.send(event);
  }

  /// Events recorded after the given id (all of them when the id
  /// is unknown or absent), plus a live subscription.
  pub fn subscribe(
    &self,
    last_event_id: Option<&str>,
  ) -> (Vec<ApiEvent>, broadcast::Receiver<ApiEvent>) {
    let receiver = self.sender.subscribe();
    let events = self.events.lock().unwrap();
    let backlog = match last_event_id {
      Some(last_id) => {
        match events.iter().position(|event| event.id == last_id)
        {
          Some(position) => {
            events.iter().skip(position + 1).cloned().collect()
          }
          None => events.iter().cloned().collect(),
        }
      }
      None => Vec::new(),
    };
    (backlog, receiver)
  }

  pub fn deployment_created(
    &self,
    project_name: &str,
    number: i64,
  ) {
    self.publish(
      "deployment:created",
      serde_json::json!({
        "project": project_name,
        "deployment": number,
      }),
    );
  }

  pub fn domain_created(&self, project_name: &str, domain: &str) {
    self.publish(
      "domain:created",
      serde_json::json!({
        "project": project_name,
        "domain": domain,
      }),
    );
  }

  pub fn domain_removed(&self, project_name: &str, domain: &str) {
    self.publish(
      "domain:removed",
      serde_json::json!({
        "project": project_name,
        "domain": domain,
      }),
    );
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn backlog_resumes_after_last_event_id() {
    let hub = EventsHub::default();
    hub.publish("a", serde_json::json!({}));
    hub.publish("b", serde_json::json!({}));
    hub.publish("c", serde_json::json!({}));
    let all: Vec<ApiEvent> =
      hub.events.lock().unwrap().iter().cloned().collect();
    let (backlog, _) = hub.subscribe(Some(&all[0].id));
    let kinds: Vec<&str> =
      backlog.iter().map(|event| event.kind.as_str()).collect();
    assert_eq!(kinds, ["b", "c"]);
    // unknown id replays everything retained
    let (backlog, _) = hub.subscribe(Some("unknown"));
    assert_eq!(backlog.len(), 3);
    // no id means live-only
    let (backlog, _) = hub.subscribe(None);
    assert!(backlog.is_empty());
  }

  #[tokio::test]
  async fn live_events_reach_subscribers() {
    let hub = EventsHub::default();
    let (_, mut receiver) = hub.subscribe(None);
    hub.deployment_created("api", 3);
    let event = receiver.recv().await.unwrap();
    assert_eq!(event.kind, "deployment:created");
    assert_eq!(event.data["deployment"], 3);
  }
}
