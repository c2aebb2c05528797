use super::{PROJECT_LABEL, docker};

/// Create an attachable overlay network. Swarm services and plain
/// containers (crons, runs, the proxy) both join these.
pub async fn create_network(
  name: &str,
  project_name: &str,
) -> anyhow::Result<()> {
  docker(
    "network create",
    &[
      "network",
      "create",
      "--driver",
      "overlay",
      "--attachable",
      "--label",
      &format!("{PROJECT_LABEL}={project_name}"),
      name,
    ],
  )
  .await?;
  Ok(())
}

pub async fn remove_network(name: &str) -> anyhow::Result<()> {
  docker("network rm", &["network", "rm", name]).await?;
  Ok(())
}

pub async fn add_network_to_container(
  container: &str,
  network: &str,
) -> anyhow::Result<()> {
  docker(
    "network connect",
    &["network", "connect", network, container],
  )
  .await?;
  Ok(())
}

pub async fn remove_network_from_container(
  container: &str,
  network: &str,
) -> anyhow::Result<()> {
  docker(
    "network disconnect",
    &["network", "disconnect", network, container],
  )
  .await?;
  Ok(())
}

pub async fn list_networks_for_project(
  project_name: &str,
) -> anyhow::Result<Vec<String>> {
  let filter =
    format!("label={PROJECT_LABEL}={project_name}");
  let output = docker(
    "network ls",
    &[
      "network",
      "ls",
      "--filter",
      &filter,
      "--format",
      "{{.Name}}",
    ],
  )
  .await?;
  Ok(
    output
      .stdout
      .lines()
      .filter(|line| !line.is_empty())
      .map(str::to_string)
      .collect(),
  )
}
