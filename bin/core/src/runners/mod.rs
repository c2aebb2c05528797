//! Ephemeral execution against live deployments: command runs,
//! interactive shells, CGI requests and SSH tunnels. All of them
//! borrow the live deployment's image, env, networks and volumes.

pub mod cgi;
pub mod run;
pub mod shell;
pub mod tunnel;

use anyhow::Context;
use database::deployments;
use disco_client::entities::{
  deployment::Deployment,
  manifest::{DiscoFile, Service, ServiceType},
  project::Project,
};

use crate::{engine, state::db_client};

/// Resolve the live deployment and its manifest, the prerequisite
/// of every runner. Callers map the error to a 422 "Must deploy
/// first".
pub async fn live_deployment_context(
  project: &Project,
) -> anyhow::Result<(Deployment, DiscoFile)> {
  let deployment =
    deployments::get_live(&db_client().pool, &project.id)
      .await?
      .context("must deploy first")?;
  let manifest =
    engine::manifest_or_default(deployment.disco_file.as_deref())?;
  Ok((deployment, manifest))
}

/// A service usable for exec-style work: present and not static.
pub fn runnable_service<'m>(
  manifest: &'m DiscoFile,
  service_name: &str,
) -> anyhow::Result<&'m Service> {
  let service = manifest
    .services
    .get(service_name)
    .with_context(|| {
      format!("service {service_name} not found")
    })?;
  if service.service_type == ServiceType::Static {
    return Err(anyhow::anyhow!(
      "service {service_name} is static and cannot run commands"
    ));
  }
  Ok(service)
}
