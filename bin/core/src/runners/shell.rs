//! Interactive shells into live deployments.
//!
//! A shell is `docker run --rm -ti <image> /bin/sh` under a
//! pseudo-terminal. The PTY is bridged to channels: stdin and
//! resize over mpsc, output fanned out over broadcast, lifecycle on
//! a cancellation token. The socket transport (auth handshake,
//! binary frames, heartbeat, close codes) sits outside the core
//! and consumes these channels.

use std::{io::Read, io::Write, time::Duration};

use anyhow::{Context, anyhow};
use bytes::Bytes;
use chrono::Utc;
use database::{api_keys, key_values};
use disco_client::entities::{
  api_key::ApiKey, manifest::DiscoFile, manifest::ServiceType,
  new_id, project::Project, project::volume_name_for_project,
};
use portable_pty::{CommandBuilder, PtySize, native_pty_system};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{docker, engine, state::db_client};

pub const SHELL_LABEL: &str = "disco.shell";
pub const SHELL_EXPIRES_LABEL: &str = "disco.shell.expires";

/// Hard lifetime limit; the TTL sweep enforces it even if the
/// process bridging the shell is gone.
pub const MAX_LIFETIME_SECS: i64 = 24 * 60 * 60;
pub const CPU_LIMIT: &str = "0.5";
pub const MEMORY_LIMIT: &str = "512m";
pub const STOP_TIMEOUT_SECS: u32 = 5;
/// Transports send a ping at this cadence.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Deserialize)]
pub struct ResizeDimensions {
  pub rows: u16,
  pub cols: u16,
}

#[derive(Clone)]
pub enum StdinMsg {
  Bytes(Bytes),
  Resize(ResizeDimensions),
}

/// Control messages the transport sends to the client as JSON text
/// frames.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ShellEvent {
  Connected { container: String },
  Ping,
  Exit { code: i32 },
}

pub struct Shell {
  pub container_name: String,
  pub cancel: CancellationToken,
  pub stdin: mpsc::Sender<StdinMsg>,
  pub stdout: broadcast::Receiver<Bytes>,
  /// Becomes `Some(code)` when the shell process exits.
  pub exit_code: watch::Receiver<Option<i32>>,
}

impl Shell {
  /// Terminate the session and its container.
  pub fn cancel(&self) {
    self.cancel.cancel();
  }
}

/// Verify a shell auth token: HS256 JWT signed with the api key
/// secret, `kid` carrying the key's public identifier.
pub async fn validate_shell_token(
  token: &str,
) -> anyhow::Result<ApiKey> {
  let header = jsonwebtoken::decode_header(token)
    .context("invalid token header")?;
  let public_key =
    header.kid.context("token missing key id")?;
  let api_key =
    api_keys::get_by_public_key(&db_client().pool, &public_key)
      .await?
      .context("unknown api key")?;
  let mut validation =
    jsonwebtoken::Validation::new(jsonwebtoken::Algorithm::HS256);
  validation.validate_exp = true;
  jsonwebtoken::decode::<serde_json::Value>(
    token,
    &jsonwebtoken::DecodingKey::from_secret(
      api_key.id.as_bytes(),
    ),
    &validation,
  )
  .context("token verification failed")?;
  Ok(api_key)
}

/// Pick the service a shell runs in when none is requested: the
/// first non-static service, preferring `web`.
pub fn resolve_service_for_shell(
  manifest: &DiscoFile,
) -> Option<String> {
  if let Some(web) = manifest.web()
    && web.service_type != ServiceType::Static
  {
    return Some(String::from("web"));
  }
  manifest
    .services
    .iter()
    .find(|(_, service)| {
      service.service_type != ServiceType::Static
    })
    .map(|(name, _)| name.clone())
}

/// Open a shell session against the live deployment.
pub async fn open_shell(
  project: &Project,
  requested_service: Option<&str>,
  by_api_key: &ApiKey,
) -> anyhow::Result<Shell> {
  let (deployment, manifest) =
    super::live_deployment_context(project).await?;
  let service_name = match requested_service {
    Some(name) => {
      super::runnable_service(&manifest, name)?;
      name.to_string()
    }
    None => resolve_service_for_shell(&manifest)
      .context("no service can run a shell")?,
  };
  let service = &manifest.services[&service_name];
  let image = docker::image_for_service(
    &manifest,
    &service_name,
    deployment.registry_host.as_deref(),
    &project.name,
    deployment.number,
  )
  .context("service image unresolved")?;

  let pool = &db_client().pool;
  let disco_host =
    key_values::get_value(pool, key_values::DISCO_HOST)
      .await?
      .unwrap_or_default();
  let mut env_variables =
    engine::decrypted_env(&deployment.id).await?;
  env_variables.extend(engine::injected_env(
    &deployment,
    &service_name,
    &disco_host,
  ));

  let container_name =
    format!("{}-shell.{}", project.name, new_id());
  let expires = Utc::now().timestamp() + MAX_LIFETIME_SECS;
  info!(
    "{} opening shell {container_name} in {service_name}",
    by_api_key.log()
  );

  let mut args: Vec<String> = vec![
    "run".into(),
    "--rm".into(),
    "--tty".into(),
    "--interactive".into(),
    "--name".into(),
    container_name.clone(),
    "--network".into(),
    docker::deployment_network_name(
      &project.name,
      deployment.number,
    ),
    "--cpus".into(),
    CPU_LIMIT.into(),
    "--memory".into(),
    MEMORY_LIMIT.into(),
    "--stop-timeout".into(),
    STOP_TIMEOUT_SECS.to_string(),
    "--log-driver".into(),
    "none".into(),
    "--label".into(),
    format!("{SHELL_LABEL}=true"),
    "--label".into(),
    format!("{SHELL_EXPIRES_LABEL}={expires}"),
    "--label".into(),
    format!("{}={}", docker::PROJECT_LABEL, project.name),
    "--label".into(),
    format!("{}={service_name}", docker::SERVICE_LABEL),
  ];
  for env_var in &env_variables {
    args.push("--env".into());
    args.push(format!("{}={}", env_var.name, env_var.value));
  }
  for volume in &service.volumes {
    args.push("--mount".into());
    args.push(format!(
      "type=volume,source={},target={}",
      volume_name_for_project(&volume.name, &project.id),
      volume.destination_path
    ));
  }
  args.push(image);
  args.push("/bin/sh".into());

  let mut cmd = CommandBuilder::new("docker");
  for arg in &args {
    cmd.arg(arg);
  }
  cmd.env("TERM", "xterm-256color");
  cmd.env("COLORTERM", "truecolor");

  let terminal = native_pty_system()
    .openpty(PtySize::default())
    .context("failed to open pty")?;
  let mut child = terminal
    .slave
    .spawn_command(cmd)
    .context("failed to spawn shell command")?;

  // Catch docker erroring out immediately (bad image, name clash)
  tokio::time::sleep(Duration::from_millis(100)).await;
  if let Some(status) = child
    .try_wait()
    .context("failed to check shell process status")?
  {
    return Err(anyhow!(
      "shell process exited immediately with code {}",
      status.exit_code()
    ));
  }

  let mut terminal_write = terminal
    .master
    .take_writer()
    .context("failed to take pty writer")?;
  let mut terminal_read = terminal
    .master
    .try_clone_reader()
    .context("failed to clone pty reader")?;

  let cancel = CancellationToken::new();
  let (exit_tx, exit_rx) = watch::channel(None);

  // CHILD WAIT TASK
  let _cancel = cancel.clone();
  let _container = container_name.clone();
  tokio::task::spawn_blocking(move || {
    loop {
      if _cancel.is_cancelled() {
        if let Err(e) = child.kill() {
          debug!("failed to kill shell child | {e:?}");
        }
        break;
      }
      match child.try_wait() {
        Ok(Some(status)) => {
          let code = status.exit_code() as i32;
          debug!("shell child exited with code {code}");
          let _ = exit_tx.send(Some(code));
          _cancel.cancel();
          break;
        }
        Ok(None) => {
          std::thread::sleep(Duration::from_millis(500));
        }
        Err(e) => {
          debug!("failed to wait for shell child | {e:?}");
          _cancel.cancel();
          break;
        }
      }
    }
    // `docker run --rm` cleans up on normal exit; force-remove in
    // case the bridge died first
    let handle = tokio::runtime::Handle::try_current();
    if let Ok(handle) = handle {
      handle.spawn(async move {
        let _ =
          docker::run::remove_container(&_container).await;
      });
    }
  });

  // channel -> stdin / resize
  let (stdin, mut channel_read) =
    mpsc::channel::<StdinMsg>(8192);
  let _cancel = cancel.clone();
  tokio::task::spawn_blocking(move || {
    loop {
      if _cancel.is_cancelled() {
        break;
      }
      match channel_read.blocking_recv() {
        Some(StdinMsg::Bytes(bytes)) => {
          if let Err(e) = terminal_write.write_all(&bytes) {
            debug!("failed to write to pty | {e:?}");
            _cancel.cancel();
            break;
          }
        }
        Some(StdinMsg::Resize(dimensions)) => {
          if let Err(e) = terminal.master.resize(PtySize {
            cols: dimensions.cols,
            rows: dimensions.rows,
            pixel_width: 0,
            pixel_height: 0,
          }) {
            debug!("failed to resize pty | {e:?}");
            _cancel.cancel();
            break;
          }
        }
        None => {
          debug!("shell stdin channel disconnected");
          _cancel.cancel();
          break;
        }
      }
    }
  });

  // PTY -> channel
  let (write, stdout) = broadcast::channel::<Bytes>(8192);
  let _cancel = cancel.clone();
  tokio::task::spawn_blocking(move || {
    let mut buf = [0u8; 8192];
    loop {
      if _cancel.is_cancelled() {
        break;
      }
      match terminal_read.read(&mut buf) {
        Ok(0) => {
          _cancel.cancel();
          break;
        }
        Ok(n) => {
          if write.send(Bytes::copy_from_slice(&buf[..n])).is_err()
          {
            _cancel.cancel();
            break;
          }
        }
        Err(e) => {
          debug!("failed to read from pty | {e:?}");
          _cancel.cancel();
          break;
        }
      }
    }
  });

  Ok(Shell {
    container_name,
    cancel,
    stdin,
    stdout,
    exit_code: exit_rx,
  })
}

/// Remove shell containers past their TTL, or all of them on
/// startup.
pub async fn clean_up_orphan_shells(remove_all: bool) {
  debug!(
    "checking for orphaned shell containers (remove_all={remove_all})"
  );
  let containers = match docker::run::list_labeled_containers(
    &format!("{SHELL_LABEL}=true"),
    SHELL_EXPIRES_LABEL,
  )
  .await
  {
    Ok(containers) => containers,
    Err(e) => {
      error!("failed to list shell containers | {e:#}");
      return;
    }
  };
  let now = Utc::now().timestamp();
  for (name, expires) in containers {
    let expired = match expires {
      Some(expires) => now > expires,
      None => true,
    };
    if remove_all || expired {
      info!("removing orphaned shell container {name}");
      let _ = docker::run::stop_container(&name).await;
      if let Err(e) = docker::run::remove_container(&name).await {
        warn!(
          "failed to remove shell container {name} | {e:#}"
        );
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn shell_prefers_web_then_any_runnable() {
    let manifest = DiscoFile::parse(
      r#"{"version":"1.0","services":{"web":{},"worker":{}}}"#,
    )
    .unwrap();
    assert_eq!(
      resolve_service_for_shell(&manifest).as_deref(),
      Some("web")
    );
    let manifest = DiscoFile::parse(
      r#"{"version":"1.0","services":{
        "web":{"type":"static"},
        "worker":{"command":"run-worker"}}}"#,
    )
    .unwrap();
    assert_eq!(
      resolve_service_for_shell(&manifest).as_deref(),
      Some("worker")
    );
    let manifest = DiscoFile::parse(
      r#"{"version":"1.0","services":{"web":{"type":"static"}}}"#,
    )
    .unwrap();
    assert_eq!(resolve_service_for_shell(&manifest), None);
  }

  #[test]
  fn shell_events_serialize_for_the_wire() {
    let event = ShellEvent::Exit { code: 130 };
    assert_eq!(
      serde_json::to_string(&event).unwrap(),
      r#"{"type":"exit","code":130}"#
    );
    let event = ShellEvent::Connected {
      container: String::from("api-shell.abc"),
    };
    assert_eq!(
      serde_json::to_string(&event).unwrap(),
      r#"{"type":"connected","container":"api-shell.abc"}"#
    );
  }
}
