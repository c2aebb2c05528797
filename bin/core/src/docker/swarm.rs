use disco_client::entities::{
  EnvVar,
  manifest::{PublishedPort, Resources},
};

use super::{
  DEPLOYMENT_LABEL, PROJECT_LABEL, SERVICE_LABEL, docker,
};

/// Everything needed to create one swarm service for a deployment.
#[derive(Debug, Clone)]
pub struct ServiceSpec {
  /// Fully qualified `<project>-<service>.<number>`.
  pub name: String,
  pub image: String,
  pub project_name: String,
  /// The manifest-level service name.
  pub service_name: String,
  pub deployment_number: i64,
  /// Decrypted name/value pairs.
  pub env_variables: Vec<EnvVar>,
  /// Resolved (volume name, destination path) pairs.
  pub volumes: Vec<(String, String)>,
  pub published_ports: Vec<PublishedPort>,
  pub networks: Vec<String>,
  pub replicas: Option<u64>,
  pub command: Option<String>,
  /// Shell command run inside the container as the health check.
  pub health: Option<String>,
  pub resources: Option<Resources>,
  /// Pass `--with-registry-auth` so nodes can pull from the
  /// configured registry.
  pub registry_auth: bool,
}

pub async fn create_service(
  spec: &ServiceSpec,
) -> anyhow::Result<()> {
  let mut args: Vec<String> = vec![
    "service".into(),
    "create".into(),
    "--name".into(),
    spec.name.clone(),
    "--detach".into(),
    "--restart-condition".into(),
    "any".into(),
  ];
  for label in [
    format!("{PROJECT_LABEL}={}", spec.project_name),
    format!("{SERVICE_LABEL}={}", spec.service_name),
    format!("{DEPLOYMENT_LABEL}={}", spec.deployment_number),
  ] {
    args.push("--label".into());
    args.push(label.clone());
    // also stamped on the containers so the log aggregator can
    // filter datagrams by project/service
    args.push("--container-label".into());
    args.push(label);
  }
  if let Some(replicas) = spec.replicas {
    args.push("--replicas".into());
    args.push(replicas.to_string());
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
  for port in &spec.published_ports {
    args.push("--publish".into());
    args.push(format!(
      "published={},target={},protocol={}",
      port.published_as, port.from_container_port, port.protocol
    ));
  }
  for network in &spec.networks {
    args.push("--network".into());
    args.push(network.clone());
  }
  if let Some(health) = &spec.health {
    args.push("--health-cmd".into());
    args.push(health.clone());
  }
  if let Some(resources) = &spec.resources {
    if let Some(cpu) = resources.cpu_limit {
      args.push("--limit-cpu".into());
      args.push(cpu.to_string());
    }
    if let Some(cpu) = resources.cpu_reservation {
      args.push("--reserve-cpu".into());
      args.push(cpu.to_string());
    }
    if let Some(memory) = &resources.memory_limit {
      args.push("--limit-memory".into());
      args.push(memory.clone());
    }
    if let Some(memory) = &resources.memory_reservation {
      args.push("--reserve-memory".into());
      args.push(memory.clone());
    }
  }
  if spec.registry_auth {
    args.push("--with-registry-auth".into());
  }
  args.push(spec.image.clone());
  if let Some(command) = &spec.command {
    args.push("sh".into());
    args.push("-c".into());
    args.push(command.clone());
  }
  let refs: Vec<&str> = args.iter().map(String::as_str).collect();
  docker("service create", &refs).await?;
  Ok(())
}

pub async fn remove_service(name: &str) -> anyhow::Result<()> {
  docker("service rm", &["service", "rm", name]).await?;
  Ok(())
}

/// Scale services to the requested replica counts. Names must be
/// fully qualified.
pub async fn scale_services(
  replicas: &[(String, u64)],
) -> anyhow::Result<()> {
  let mut args: Vec<String> =
    vec!["service".into(), "scale".into(), "--detach".into()];
  for (name, count) in replicas {
    args.push(format!("{name}={count}"));
  }
  let refs: Vec<&str> = args.iter().map(String::as_str).collect();
  docker("service scale", &refs).await?;
  Ok(())
}

pub async fn list_services_for_project(
  project_name: &str,
) -> anyhow::Result<Vec<String>> {
  list_services(&[&format!(
    "label={PROJECT_LABEL}={project_name}"
  )])
  .await
}

pub async fn list_services_for_deployment(
  project_name: &str,
  deployment_number: i64,
) -> anyhow::Result<Vec<String>> {
  list_services(&[
    &format!("label={PROJECT_LABEL}={project_name}"),
    &format!("label={DEPLOYMENT_LABEL}={deployment_number}"),
  ])
  .await
}

pub async fn list_services_by_label(
  label: &str,
) -> anyhow::Result<Vec<String>> {
  list_services(&[&format!("label={label}")]).await
}

async fn list_services(
  filters: &[&str],
) -> anyhow::Result<Vec<String>> {
  let mut args = vec!["service", "ls"];
  for filter in filters {
    args.push("--filter");
    args.push(filter);
  }
  args.push("--format");
  args.push("{{.Name}}");
  let output = docker("service ls", &args).await?;
  Ok(
    output
      .stdout
      .lines()
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect(),
  )
}
