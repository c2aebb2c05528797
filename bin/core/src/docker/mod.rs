//! Narrow wrapper over the docker CLI.
//!
//! Every mutation goes through the `docker` binary on the mounted
//! engine socket; failures surface as [ContainerError] with the
//! engine's stderr attached. Object names and labels follow fixed
//! conventions so anything Disco created can be enumerated and
//! reclaimed by label alone.

use anyhow::Context;
use command::CommandOutput;
use disco_client::entities::manifest::DiscoFile;

pub mod build;
pub mod images;
pub mod networks;
pub mod run;
pub mod swarm;
pub mod volumes;

/// Network every disco infrastructure container is attached to.
pub const MAIN_NETWORK: &str = "disco-main";
/// The reverse proxy container, attached to per-deployment web
/// networks during cutover.
pub const CADDY_CONTAINER: &str = "disco-caddy";

pub const PROJECT_LABEL: &str = "disco.project.name";
pub const SERVICE_LABEL: &str = "disco.service.name";
pub const DEPLOYMENT_LABEL: &str = "disco.deployment.number";

#[derive(Debug, thiserror::Error)]
#[error(
  "docker {operation} failed (exit {exit_code:?}): {stderr}"
)]
pub struct ContainerError {
  pub operation: String,
  pub stderr: String,
  pub exit_code: Option<i32>,
}

impl ContainerError {
  pub(crate) fn new(
    operation: &str,
    output: &CommandOutput,
  ) -> ContainerError {
    ContainerError {
      operation: operation.to_string(),
      stderr: output.combined().trim().to_string(),
      exit_code: output.exit_code,
    }
  }
}

/// Run a docker subcommand, mapping non-zero exits to
/// [ContainerError].
pub(crate) async fn docker(
  operation: &str,
  args: &[&str],
) -> anyhow::Result<CommandOutput> {
  let mut full = vec!["docker"];
  full.extend(args);
  let output = command::call(&full)
    .await
    .with_context(|| format!("failed to run docker {operation}"))?;
  if output.success() {
    Ok(output)
  } else {
    Err(ContainerError::new(operation, &output).into())
  }
}

/// `disco/project-<project>-<image_key>:<number>`, prefixed with the
/// registry host when one is configured.
pub fn image_name(
  registry_host: Option<&str>,
  project_name: &str,
  image_key: &str,
  deployment_number: i64,
) -> String {
  let base = format!(
    "disco/project-{project_name}-{image_key}:{deployment_number}"
  );
  match registry_host {
    Some(host) => format!("{host}/{base}"),
    None => base,
  }
}

/// The image a service runs: its registry pin when it has one,
/// otherwise the image built for this deployment.
pub fn image_for_service(
  disco_file: &DiscoFile,
  service_name: &str,
  registry_host: Option<&str>,
  project_name: &str,
  deployment_number: i64,
) -> Option<String> {
  let service = disco_file.services.get(service_name)?;
  let image = disco_file.image_for_service(service);
  match image.pull {
    Some(pull) => Some(pull),
    None => Some(image_name(
      registry_host,
      project_name,
      &service.image,
      deployment_number,
    )),
  }
}

/// `<project>-<service>.<number>`
pub fn service_name(
  project_name: &str,
  service: &str,
  deployment_number: i64,
) -> String {
  format!("{project_name}-{service}.{deployment_number}")
}

/// `<project>-network-<number>`
pub fn deployment_network_name(
  project_name: &str,
  deployment_number: i64,
) -> String {
  format!("{project_name}-network-{deployment_number}")
}

/// `<project>-caddy-<number>`, peering the reverse proxy with the
/// web service.
pub fn deployment_web_network_name(
  project_name: &str,
  deployment_number: i64,
) -> String {
  format!("{project_name}-caddy-{deployment_number}")
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn naming_conventions() {
    assert_eq!(
      image_name(None, "api", "default", 2),
      "disco/project-api-default:2"
    );
    assert_eq!(
      image_name(Some("registry.example.com"), "api", "default", 2),
      "registry.example.com/disco/project-api-default:2"
    );
    assert_eq!(service_name("api", "web", 2), "api-web.2");
    assert_eq!(deployment_network_name("api", 2), "api-network-2");
    assert_eq!(
      deployment_web_network_name("api", 2),
      "api-caddy-2"
    );
  }

  #[test]
  fn pull_pins_bypass_built_images() {
    let manifest = DiscoFile::parse(
      r#"{"version":"1.0","services":{
        "cache":{"image":"valkey"},
        "web":{}
      },"images":{"valkey":{"pull":"valkey/valkey:8"}}}"#,
    )
    .unwrap();
    assert_eq!(
      image_for_service(&manifest, "cache", None, "api", 3)
        .as_deref(),
      Some("valkey/valkey:8")
    );
    assert_eq!(
      image_for_service(&manifest, "web", None, "api", 3)
        .as_deref(),
      Some("disco/project-api-default:3")
    );
    assert_eq!(
      image_for_service(&manifest, "missing", None, "api", 3),
      None
    );
  }
}
