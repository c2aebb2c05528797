use std::{path::PathBuf, sync::OnceLock};

use anyhow::Context;
use disco_client::entities::logger::{
  LogConfig, LogLevel, StdioLogMode,
};
use serde::Deserialize;

/// Environment overrides, all optional. Paths default to the
/// standard `/disco` layout the install tooling provisions.
#[derive(Debug, Deserialize)]
struct Env {
  disco_database_path: Option<PathBuf>,
  disco_command_outputs_dir: Option<PathBuf>,
  disco_projects_dir: Option<PathBuf>,
  disco_srv_dir: Option<PathBuf>,
  disco_encryption_key_path: Option<PathBuf>,
  disco_caddy_socket: Option<PathBuf>,
  disco_daemon_upstream: Option<String>,
  disco_log_udp_port: Option<u16>,
  disco_log_level: Option<LogLevel>,
  disco_log_stdio: Option<StdioLogMode>,
  disco_log_pretty: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
  /// Primary store.
  pub database_path: PathBuf,
  /// Per-source output stream files.
  pub command_outputs_dir: PathBuf,
  /// Git working trees, one directory per project.
  pub projects_dir: PathBuf,
  /// Static site docroots, `<srv_dir>/<project>/<number>`.
  pub srv_dir: PathBuf,
  /// 32 raw bytes mounted by the swarm secret.
  pub encryption_key_path: PathBuf,
  /// Caddy admin API socket.
  pub caddy_socket: PathBuf,
  /// Upstream the `/.disco` subroute and placeholder routes dial.
  pub daemon_upstream: String,
  /// UDP port the global log aggregator listens on.
  pub log_udp_port: u16,
  pub logging: LogConfig,
}

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let env: Env = match envy::from_env()
      .context("failed to parse Disco environment")
    {
      Ok(env) => env,
      Err(e) => panic!("{e:?}"),
    };
    CoreConfig {
      database_path: env
        .disco_database_path
        .unwrap_or_else(|| "/disco/data/disco.sqlite3".into()),
      command_outputs_dir: env
        .disco_command_outputs_dir
        .unwrap_or_else(|| "/disco/data/commandoutputs".into()),
      projects_dir: env
        .disco_projects_dir
        .unwrap_or_else(|| "/disco/projects".into()),
      srv_dir: env.disco_srv_dir.unwrap_or_else(|| "/disco/srv".into()),
      encryption_key_path: env
        .disco_encryption_key_path
        .unwrap_or_else(|| "/run/secrets/disco_encryption_key".into()),
      caddy_socket: env
        .disco_caddy_socket
        .unwrap_or_else(|| "/var/run/caddy/caddy.sock".into()),
      daemon_upstream: env
        .disco_daemon_upstream
        .unwrap_or_else(|| String::from("disco-daemon:6543")),
      log_udp_port: env.disco_log_udp_port.unwrap_or(6544),
      logging: LogConfig {
        level: env.disco_log_level.unwrap_or_default(),
        stdio: env.disco_log_stdio.unwrap_or_default(),
        pretty: env.disco_log_pretty.unwrap_or_default(),
      },
    }
  })
}

impl CoreConfig {
  pub fn project_dir(&self, project_name: &str) -> PathBuf {
    self.projects_dir.join(project_name)
  }

  pub fn static_site_dir(
    &self,
    project_name: &str,
    deployment_number: i64,
  ) -> PathBuf {
    self
      .srv_dir
      .join(project_name)
      .join(deployment_number.to_string())
  }
}
