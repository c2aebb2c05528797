//! Ephemeral SSH tunnels into project services.
//!
//! A tunnel is a one-off swarm service wrapping an SSH endpoint,
//! published on a host port and joined to the main network. Active
//! tunnels carry a sliding five-minute expiry; the minute sweep
//! stops expired ones, the hourly sweep kills anything running
//! that is no longer tracked.

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

use crate::docker;

pub const TUNNEL_LABEL: &str = "disco.tunnels";
pub const TUNNEL_IMAGE: &str = "letsdiscodev/sshtunnel";
const EXPIRY: Duration = Duration::minutes(5);

struct ActiveTunnel {
  service_name: String,
  expires: DateTime<Utc>,
}

#[derive(Default)]
pub struct TunnelsHub {
  active: Mutex<Vec<ActiveTunnel>>,
}

pub fn tunnel_service_name(port: u16) -> String {
  format!("disco-tunnel-{port}")
}

impl TunnelsHub {
  /// Create the tunnel service and start tracking it.
  pub async fn create_tunnel(
    &self,
    port: u16,
    password: &str,
  ) -> anyhow::Result<String> {
    let service_name = tunnel_service_name(port);
    let publish =
      format!("published={port},target=22,protocol=tcp");
    let env = format!("PASSWORD={password}");
    docker::docker(
      "service create",
      &[
        "service",
        "create",
        "--name",
        &service_name,
        "--detach",
        "--env",
        &env,
        "--publish",
        &publish,
        "--network",
        docker::MAIN_NETWORK,
        "--label",
        TUNNEL_LABEL,
        TUNNEL_IMAGE,
      ],
    )
    .await?;
    self.monitor_tunnel(&service_name).await;
    Ok(service_name)
  }

  /// Track an existing tunnel with a fresh expiry.
  pub async fn monitor_tunnel(&self, service_name: &str) {
    info!("monitoring tunnel {service_name}");
    self.active.lock().await.push(ActiveTunnel {
      service_name: service_name.to_string(),
      expires: Utc::now() + EXPIRY,
    });
  }

  /// Slide a tunnel's expiry another five minutes.
  pub async fn extend_tunnel_expiration(
    &self,
    service_name: &str,
  ) {
    let mut active = self.active.lock().await;
    for tunnel in active.iter_mut() {
      if tunnel.service_name == service_name {
        tunnel.expires = Utc::now() + EXPIRY;
        return;
      }
    }
    warn!("active tunnel {service_name} not found, not extending");
  }

  /// Stop a tunnel now, whether or not it is still tracked.
  pub async fn close_tunnel(&self, service_name: &str) {
    info!("closing tunnel {service_name}");
    self
      .active
      .lock()
      .await
      .retain(|tunnel| tunnel.service_name != service_name);
    if let Ok(running) = running_tunnels().await
      && running.iter().any(|name| name == service_name)
      && let Err(e) =
        docker::swarm::remove_service(service_name).await
    {
      warn!("failed to stop tunnel {service_name} | {e:#}");
    }
  }

  async fn active_tunnels(&self) -> Vec<String> {
    let mut active = self.active.lock().await;
    let now = Utc::now();
    active.retain(|tunnel| tunnel.expires > now);
    active
      .iter()
      .map(|tunnel| tunnel.service_name.clone())
      .collect()
  }

  /// Minute sweep: stop tunnels whose expiry lapsed.
  pub async fn stop_expired_tunnels(&self) {
    let active: Vec<String> = self.active_tunnels().await;
    let running = match running_tunnels().await {
      Ok(running) => running,
      Err(e) => {
        error!("failed to list running tunnels | {e:#}");
        return;
      }
    };
    for tunnel in running {
      if !active.contains(&tunnel) {
        info!("stopping expired tunnel {tunnel}");
        if let Err(e) =
          docker::swarm::remove_service(&tunnel).await
        {
          warn!("failed to stop tunnel {tunnel} | {e:#}");
        }
      }
    }
  }

  /// Hourly sweep: anything labeled as a tunnel but untracked is
  /// rogue (left over from a crash) and gets killed.
  pub async fn clean_up_rogue_tunnels(&self) {
    self.stop_expired_tunnels().await;
  }
}

async fn running_tunnels() -> anyhow::Result<Vec<String>> {
  docker::swarm::list_services_by_label(TUNNEL_LABEL).await
}
