use database::deployments;

use super::docker;
use crate::state::db_client;

/// Day-tick garbage collection: remove project images no active
/// deployment references anymore.
pub async fn remove_unused_images() -> anyhow::Result<()> {
  info!("cleaning up Docker images");
  let images = list_images().await?;
  let active: Vec<(String, i64)> =
    deployments::get_active(&db_client().pool)
      .await?
      .into_iter()
      .map(|deployment| {
        (deployment.project_name, deployment.number)
      })
      .collect();
  for (repository, tag) in images {
    if !should_remove_image(
      strip_registry(&repository),
      &tag,
      &active,
    ) {
      continue;
    }
    let image = if tag == "<none>" {
      repository.clone()
    } else {
      format!("{repository}:{tag}")
    };
    info!("removing Docker image {image}");
    if let Err(e) = remove_image(&image).await {
      warn!("failed to remove image {image} | {e:#}");
    }
  }
  info!("done cleaning up Docker images");
  Ok(())
}

/// (repository, tag) pairs for every image on the node.
pub async fn list_images()
-> anyhow::Result<Vec<(String, String)>> {
  let output = docker(
    "image ls",
    &[
      "image",
      "ls",
      "--format",
      "{{.Repository}}\t{{.Tag}}",
    ],
  )
  .await?;
  Ok(
    output
      .stdout
      .lines()
      .filter_map(|line| {
        let (repository, tag) = line.split_once('\t')?;
        Some((repository.to_string(), tag.to_string()))
      })
      .collect(),
  )
}

pub async fn remove_image(image: &str) -> anyhow::Result<()> {
  docker("image rm", &["image", "rm", image]).await?;
  Ok(())
}

/// Whether a project image is no longer referenced by any active
/// deployment and can be reclaimed.
///
/// Non-disco images are never touched. A tag that is not a
/// deployment number (for example `<none>`) is reclaimed once its
/// project has any active deployment record at all.
pub fn should_remove_image(
  repository: &str,
  tag: &str,
  active: &[(String, i64)],
) -> bool {
  let Some(suffix) = repository.strip_prefix("disco/project-")
  else {
    return false;
  };
  // repository form: <project>-<image_key>; registry prefixes are
  // stripped before matching
  for (project_name, deployment_number) in active {
    if !suffix.starts_with(&format!("{project_name}-")) {
      continue;
    }
    if let Ok(tag_number) = tag.parse::<i64>()
      && tag_number == *deployment_number
    {
      return false;
    }
  }
  true
}

/// Strip a `host[:port]/` registry prefix so repository names match
/// the `disco/project-` convention.
pub fn strip_registry(repository: &str) -> &str {
  match repository.split_once('/') {
    Some((first, rest))
      if first.contains('.') || first.contains(':') =>
    {
      rest
    }
    _ => repository,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn keeps_active_deployment_images() {
    let active = vec![(String::from("api"), 4)];
    assert!(!should_remove_image(
      "disco/project-api-default",
      "4",
      &active
    ));
    assert!(should_remove_image(
      "disco/project-api-default",
      "3",
      &active
    ));
    assert!(should_remove_image(
      "disco/project-api-default",
      "<none>",
      &active
    ));
  }

  #[test]
  fn never_touches_foreign_images() {
    assert!(!should_remove_image("postgres", "16", &[]));
    assert!(!should_remove_image(
      "valkey/valkey",
      "8",
      &[(String::from("valkey"), 1)]
    ));
  }

  #[test]
  fn registry_prefixes_are_stripped() {
    assert_eq!(
      strip_registry("registry.example.com:5000/disco/project-a-default"),
      "disco/project-a-default"
    );
    assert_eq!(
      strip_registry("disco/project-a-default"),
      "disco/project-a-default"
    );
  }
}
