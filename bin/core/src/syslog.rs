//! Syslog destinations and the logspout shipper service.
//!
//! The `SYSLOG_URLS` key value holds a JSON array of destinations.
//! Core entries are appended at provisioning and only capture
//! containers labeled `disco.log.core=true`; global entries are
//! operator-managed. Whenever the list changes the logspout swarm
//! service is reconciled to ship to the current set.

use anyhow::Context;
use chrono::{DateTime, Duration, Utc};
use database::{key_values, sqlx::SqlitePool};
use disco_client::entities::syslog::{SyslogUrl, SyslogUrlType};
use tokio::sync::Mutex;

use crate::{docker, state::db_client};

pub const SYSLOG_SERVICE_LABEL: &str = "disco.syslogs";
const LOGSPOUT_SERVICE: &str = "disco-syslog";
const LOGSPOUT_IMAGE: &str = "gliderlabs/logspout:latest";
const LOGSPOUT_RAW_FORMAT: &str = concat!(
  r#"{ "container" : "{{`{{ .Container.Name }}`}}", "#,
  r#""labels": {{`{{ toJSON .Container.Config.Labels }}`}}, "#,
  r#""timestamp": "{{`{{ .Time.Format "2006-01-02T15:04:05Z07:00" }}`}}", "#,
  r#""message": {{`{{ toJSON .Data }}`}} }"#,
);

pub async fn get_syslog_urls(
  pool: &SqlitePool,
) -> anyhow::Result<Vec<SyslogUrl>> {
  let raw =
    key_values::get_value(pool, key_values::SYSLOG_URLS).await?;
  match raw {
    Some(raw) => {
      serde_json::from_str(&raw).context("invalid SYSLOG_URLS")
    }
    None => Ok(Vec::new()),
  }
}

async fn save_syslog_urls(
  pool: &SqlitePool,
  urls: &[SyslogUrl],
) -> anyhow::Result<()> {
  key_values::set_value(
    pool,
    key_values::SYSLOG_URLS,
    Some(&serde_json::to_string(urls)?),
  )
  .await
}

/// Add an operator-managed destination; already-present URLs are
/// left alone.
pub async fn add_syslog_url(
  url: &str,
) -> anyhow::Result<Vec<SyslogUrl>> {
  let pool = &db_client().pool;
  let mut urls = get_syslog_urls(pool).await?;
  if !urls.iter().any(|entry| entry.url == url) {
    info!("adding syslog url {url}");
    urls.push(SyslogUrl {
      url: url.to_string(),
      url_type: SyslogUrlType::Global,
    });
  }
  save_syslog_urls(pool, &urls).await?;
  reconcile_logspout(&urls).await?;
  Ok(urls)
}

pub async fn remove_syslog_url(
  url: &str,
) -> anyhow::Result<Vec<SyslogUrl>> {
  let pool = &db_client().pool;
  let mut urls = get_syslog_urls(pool).await?;
  let before = urls.len();
  urls.retain(|entry| {
    entry.url != url || entry.url_type != SyslogUrlType::Global
  });
  if urls.len() != before {
    info!("removing syslog url {url}");
  }
  save_syslog_urls(pool, &urls).await?;
  reconcile_logspout(&urls).await?;
  Ok(urls)
}

/// Replace the core destinations, keeping the operator-managed
/// ones. Called by provisioning.
pub async fn set_core_syslogs(
  urls: &[String],
) -> anyhow::Result<Vec<SyslogUrl>> {
  let pool = &db_client().pool;
  let mut merged: Vec<SyslogUrl> = urls
    .iter()
    .map(|url| SyslogUrl {
      url: url.clone(),
      url_type: SyslogUrlType::Core,
    })
    .collect();
  merged.extend(
    get_syslog_urls(pool)
      .await?
      .into_iter()
      .filter(|entry| entry.url_type != SyslogUrlType::Core),
  );
  save_syslog_urls(pool, &merged).await?;
  reconcile_logspout(&merged).await?;
  Ok(merged)
}

/// Make the logspout swarm service match the destination list:
/// remove it when the list is empty, otherwise recreate it shipping
/// to every URL.
pub async fn reconcile_logspout(
  urls: &[SyslogUrl],
) -> anyhow::Result<()> {
  let running =
    docker::swarm::list_services_by_label(SYSLOG_SERVICE_LABEL)
      .await?;
  if running.iter().any(|name| name == LOGSPOUT_SERVICE) {
    docker::swarm::remove_service(LOGSPOUT_SERVICE).await?;
  }
  if urls.is_empty() {
    return Ok(());
  }
  let targets: Vec<String> =
    urls.iter().map(SyslogUrl::logspout_url).collect();
  let targets = targets.join(",");
  docker::docker(
    "service create",
    &[
      "service",
      "create",
      "--name",
      LOGSPOUT_SERVICE,
      "--detach",
      "--mode",
      "global",
      "--env",
      "BACKLOG=false",
      "--env",
      "ALLOW_TTY=true",
      "--env",
      &format!("RAW_FORMAT={LOGSPOUT_RAW_FORMAT}"),
      "--mount",
      "type=bind,source=/var/run/docker.sock,target=/var/run/docker.sock",
      "--network",
      docker::MAIN_NETWORK,
      "--label",
      SYSLOG_SERVICE_LABEL,
      LOGSPOUT_IMAGE,
      &targets,
    ],
  )
  .await?;
  Ok(())
}

struct ActiveSyslog {
  service_name: String,
  expires: DateTime<Utc>,
}

/// Tracks on-demand per-stream logspout services (log follows),
/// which expire after 24 hours.
#[derive(Default)]
pub struct SyslogsHub {
  active: Mutex<Vec<ActiveSyslog>>,
}

impl SyslogsHub {
  pub async fn monitor_syslog(&self, service_name: &str) {
    info!("monitoring syslog service {service_name}");
    self.active.lock().await.push(ActiveSyslog {
      service_name: service_name.to_string(),
      expires: Utc::now() + Duration::hours(24),
    });
  }

  async fn active_syslogs(&self) -> Vec<String> {
    let mut active = self.active.lock().await;
    let now = Utc::now();
    active.retain(|entry| entry.expires > now);
    active
      .iter()
      .map(|entry| entry.service_name.clone())
      .collect()
  }

  /// Day sweep: kill labeled syslog services nobody tracks. The
  /// reconciled shipper itself is tracked implicitly by being
  /// recreated on every change.
  pub async fn clean_up_rogue_syslogs(&self) {
    let active = self.active_syslogs().await;
    let running = match docker::swarm::list_services_by_label(
      SYSLOG_SERVICE_LABEL,
    )
    .await
    {
      Ok(running) => running,
      Err(e) => {
        error!("failed to list syslog services | {e:#}");
        return;
      }
    };
    for service in running {
      if service == LOGSPOUT_SERVICE {
        continue;
      }
      if !active.contains(&service) {
        warn!("killing rogue syslog {service}");
        if let Err(e) =
          docker::swarm::remove_service(&service).await
        {
          warn!("failed to remove syslog {service} | {e:#}");
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn raw_format_is_valid_logspout_template() {
    assert!(LOGSPOUT_RAW_FORMAT.contains(
      "{{`{{ .Container.Name }}`}}"
    ));
    assert!(
      LOGSPOUT_RAW_FORMAT
        .contains("toJSON .Container.Config.Labels")
    );
  }
}
