//! Ephemeral containers: command runs, crons, CGI and shells all go
//! through here. Containers are `docker create`d first so extra
//! networks can be connected before start, then started attached.

use std::time::Duration;

use anyhow::Context;
use disco_client::entities::EnvVar;
use tokio::sync::mpsc::UnboundedSender;

use super::{ContainerError, docker};

#[derive(Debug, Clone)]
pub struct EphemeralSpec {
  pub name: String,
  pub image: String,
  pub env_variables: Vec<EnvVar>,
  /// Resolved (volume name, destination path) pairs.
  pub volumes: Vec<(String, String)>,
  pub networks: Vec<String>,
  pub command: Option<String>,
  /// `disco.run=true` style markers plus the TTL label.
  pub labels: Vec<(String, String)>,
  /// Keep stdin open (`docker create --interactive`).
  pub interactive: bool,
  /// Remove the container when it exits.
  pub auto_remove: bool,
}

/// Create the container without starting it, connecting every
/// requested network. A later `docker start --attach` (here or from
/// an attached session) runs it.
pub async fn create_container(
  spec: &EphemeralSpec,
) -> anyhow::Result<()> {
  let mut args: Vec<String> =
    vec!["create".into(), "--name".into(), spec.name.clone()];
  if spec.interactive {
    args.push("--interactive".into());
  }
  if spec.auto_remove {
    args.push("--rm".into());
  }
  for (key, value) in &spec.labels {
    args.push("--label".into());
    args.push(format!("{key}={value}"));
  }
  for env_var in &spec.env_variables {
    args.push("--env".into());
    args.push(format!("{}={}", env_var.name, env_var.value));
  }
  for (source, target) in &spec.volumes {
    args.push("--mount".into());
    args
      .push(format!("type=volume,source={source},target={target}"));
  }
  if let Some(network) = spec.networks.first() {
    args.push("--network".into());
    args.push(network.clone());
  }
  args.push(spec.image.clone());
  if let Some(command) = &spec.command {
    args.push("sh".into());
    args.push("-c".into());
    args.push(command.clone());
  }
  let refs: Vec<&str> = args.iter().map(String::as_str).collect();
  docker("create", &refs).await?;
  for network in spec.networks.iter().skip(1) {
    super::networks::add_network_to_container(&spec.name, network)
      .await?;
  }
  Ok(())
}

/// Start a created container attached, streaming output lines and
/// optionally piping `stdin`. Returns once the container exits;
/// non-zero exits and timeouts are errors.
pub async fn start_attached(
  name: &str,
  stdin: Option<Vec<u8>>,
  output: UnboundedSender<String>,
  timeout: Option<Duration>,
) -> anyhow::Result<()> {
  let mut args = vec!["docker", "start", "--attach", name];
  if stdin.is_some() {
    args.insert(2, "--interactive");
  }
  let exit_code = command::call_streaming_with_stdin(
    &args, stdin, output, timeout,
  )
  .await?;
  if exit_code == Some(0) {
    Ok(())
  } else {
    Err(
      ContainerError {
        operation: String::from("start"),
        stderr: format!("container {name} exited non-zero"),
        exit_code,
      }
      .into(),
    )
  }
}

/// Create, connect networks, run to completion, then force-remove.
pub async fn run_attached(
  spec: &EphemeralSpec,
  stdin: Option<Vec<u8>>,
  output: UnboundedSender<String>,
  timeout: Option<Duration>,
) -> anyhow::Result<()> {
  create_container(spec).await?;
  let result =
    start_attached(&spec.name, stdin, output, timeout).await;
  // The container may already be gone when auto_remove raced us.
  let _ = remove_container(&spec.name).await;
  result
}

/// Exec an argv inside a running container, streaming output.
pub async fn exec(
  container: &str,
  argv: &[&str],
  output: UnboundedSender<String>,
) -> anyhow::Result<Option<i32>> {
  let mut args = vec!["docker", "exec", container];
  args.extend(argv);
  command::call_streaming(&args, output, None)
    .await
    .context("failed to exec in container")
}

pub async fn container_exists(name: &str) -> bool {
  let filter = format!("name=^{name}$");
  match docker(
    "ps",
    &[
      "ps", "--all", "--filter", &filter, "--format", "{{.Names}}",
    ],
  )
  .await
  {
    Ok(output) => {
      output.stdout.lines().any(|line| line == name)
    }
    Err(e) => {
      warn!("failed to check container {name} | {e:#}");
      false
    }
  }
}

pub async fn stop_container(name: &str) -> anyhow::Result<()> {
  docker("stop", &["stop", name]).await?;
  Ok(())
}

pub async fn remove_container(name: &str) -> anyhow::Result<()> {
  docker("rm", &["rm", "--force", name]).await?;
  Ok(())
}

/// (name, value of `expires_label`) for every container carrying
/// `marker_label`, running or not. Feeds the TTL sweeps.
pub async fn list_labeled_containers(
  marker_label: &str,
  expires_label: &str,
) -> anyhow::Result<Vec<(String, Option<i64>)>> {
  let filter = format!("label={marker_label}");
  let format =
    format!("{{{{.Names}}}}\t{{{{.Label \"{expires_label}\"}}}}");
  let output = docker(
    "ps",
    &["ps", "--all", "--filter", &filter, "--format", &format],
  )
  .await?;
  Ok(
    output
      .stdout
      .lines()
      .filter(|line| !line.is_empty())
      .map(|line| {
        let (name, expires) =
          line.split_once('\t').unwrap_or((line, ""));
        (name.to_string(), expires.trim().parse().ok())
      })
      .collect(),
  )
}
