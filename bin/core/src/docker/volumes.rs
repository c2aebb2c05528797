use super::docker;

pub async fn list_volumes() -> anyhow::Result<Vec<String>> {
  let output = docker(
    "volume ls",
    &["volume", "ls", "--format", "{{.Name}}"],
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

/// Volumes created for a project's manifest volume mounts, by
/// their `disco-project-<id>-` name prefix.
pub async fn list_volumes_for_project(
  project_id: &str,
) -> anyhow::Result<Vec<String>> {
  let prefix = format!("disco-project-{project_id}-");
  Ok(
    list_volumes()
      .await?
      .into_iter()
      .filter(|name| name.starts_with(&prefix))
      .collect(),
  )
}

pub async fn remove_volume(name: &str) -> anyhow::Result<()> {
  docker("volume rm", &["volume", "rm", name]).await?;
  Ok(())
}
