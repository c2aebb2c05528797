//! The deployment engine: entry operations here, the pipeline in
//! [flow].

use anyhow::{Context, anyhow};
use database::{
  deployments, domains, env_variables, key_values, tasks,
};
use disco_client::entities::{
  EnvVar,
  deployment::Deployment,
  manifest::{DiscoFile, ServiceType},
  project::Project,
  task::{ProcessDeploymentBody, TaskName},
};

use crate::{docker, encryption, state::db_client};

pub mod flow;
mod static_site;

/// Parse manifest bytes, or the default `{web: container}` manifest
/// when there are none.
pub fn manifest_or_default(
  disco_file: Option<&str>,
) -> anyhow::Result<DiscoFile> {
  match disco_file {
    Some(contents) => Ok(DiscoFile::parse(contents)?),
    None => Ok(DiscoFile::default_manifest()),
  }
}

/// Allocate the next deployment, snapshot project state, and hand it
/// to the worker. The queued task is the only entry into the
/// pipeline.
pub async fn create_deployment(
  project: &Project,
  commit_hash: Option<String>,
  disco_file: Option<String>,
  by_api_key_id: Option<String>,
) -> anyhow::Result<Deployment> {
  if let Some(contents) = &disco_file {
    // surfaces InvalidManifest before anything is written
    DiscoFile::parse(contents)?;
  }
  let pool = &db_client().pool;
  let mut tx = pool.begin().await?;
  let registry_host =
    key_values::get_value(&mut *tx, key_values::REGISTRY_HOST)
      .await?;
  let domain = domains::get_for_project(&mut *tx, &project.id)
    .await?
    .into_iter()
    .next()
    .map(|domain| domain.name);
  let env_variables =
    env_variables::get_for_project(&mut *tx, &project.id)
      .await?
      .into_iter()
      .map(|env_var| EnvVar::new(env_var.name, env_var.value))
      .collect();
  let deployment = deployments::create(
    &mut tx,
    deployments::NewDeployment {
      project,
      commit_hash,
      disco_file,
      registry_host,
      domain,
      by_api_key_id,
      env_variables,
    },
  )
  .await?;
  let task = tasks::enqueue(
    &mut *tx,
    TaskName::ProcessDeployment,
    &ProcessDeploymentBody {
      deployment_id: deployment.id.clone(),
    },
  )
  .await?;
  deployments::set_task_id(&mut *tx, &deployment.id, &task.id)
    .await?;
  tx.commit().await?;
  info!(
    "queued deployment {} of {}",
    deployment.number, project.name
  );
  Ok(deployment)
}

/// Scale services of the live deployment. Unknown or
/// non-`container` services are rejected before any engine call.
pub async fn scale(
  project: &Project,
  replicas: &[(String, u64)],
) -> anyhow::Result<()> {
  let pool = &db_client().pool;
  let deployment = deployments::get_live(pool, &project.id)
    .await?
    .context("must deploy first")?;
  let manifest =
    manifest_or_default(deployment.disco_file.as_deref())?;
  let mut qualified = Vec::with_capacity(replicas.len());
  for (service, count) in replicas {
    let Some(spec) = manifest.services.get(service) else {
      return Err(anyhow!(
        "service {service} not found in project {}",
        project.name
      ));
    };
    if spec.service_type != ServiceType::Container {
      return Err(anyhow!(
        "service {service} is {}, not container",
        spec.service_type
      ));
    }
    qualified.push((
      docker::service_name(
        &project.name,
        service,
        deployment.number,
      ),
      *count,
    ));
  }
  docker::swarm::scale_services(&qualified).await
}

/// Upsert encrypted env variables and queue a redeploy carrying the
/// live deployment's commit and captured manifest. There is no
/// in-place env update; the rollout is the update.
pub async fn set_env_variables(
  project: &Project,
  pairs: &[(String, String)],
  by_api_key_id: Option<String>,
) -> anyhow::Result<Deployment> {
  let pool = &db_client().pool;
  for (name, value) in pairs {
    let encrypted = encryption::encrypt(value)?;
    env_variables::set(
      pool,
      &project.id,
      name,
      &encrypted,
      by_api_key_id.as_deref(),
    )
    .await?;
  }
  let live = deployments::get_live(pool, &project.id).await?;
  let (commit_hash, disco_file) = match live {
    Some(live) => (live.commit_hash, live.disco_file),
    None => (None, None),
  };
  create_deployment(project, commit_hash, disco_file, by_api_key_id)
    .await
}

/// Remove a single env variable and redeploy, mirroring
/// [set_env_variables].
pub async fn delete_env_variable(
  project: &Project,
  name: &str,
  by_api_key_id: Option<String>,
) -> anyhow::Result<Option<Deployment>> {
  let pool = &db_client().pool;
  if !env_variables::delete(pool, &project.id, name).await? {
    return Ok(None);
  }
  let live = deployments::get_live(pool, &project.id).await?;
  let (commit_hash, disco_file) = match live {
    Some(live) => (live.commit_hash, live.disco_file),
    None => (None, None),
  };
  let deployment = create_deployment(
    project,
    commit_hash,
    disco_file,
    by_api_key_id,
  )
  .await?;
  Ok(Some(deployment))
}

/// Tear a project down: crons, services, networks, volumes, proxy
/// route, then the project's rows. Deployment history stays (rows
/// are never deleted); their images become eligible for the daily
/// image GC once nothing references them.
pub async fn remove_project(
  project: &Project,
) -> anyhow::Result<()> {
  let pool = &db_client().pool;
  crate::state::scheduler()
    .remove_project_crons(&project.name)
    .await;
  for service in
    docker::swarm::list_services_for_project(&project.name).await?
  {
    if let Err(e) =
      docker::swarm::remove_service(&service).await
    {
      warn!("failed to remove service {service} | {e:#}");
    }
  }
  for network in
    docker::networks::list_networks_for_project(&project.name)
      .await?
  {
    // the web networks are also attached to the proxy container
    let _ = docker::networks::remove_network_from_container(
      docker::CADDY_CONTAINER,
      &network,
    )
    .await;
    if let Err(e) =
      docker::networks::remove_network(&network).await
    {
      warn!("failed to remove network {network} | {e:#}");
    }
  }
  for volume in
    docker::volumes::list_volumes_for_project(&project.id).await?
  {
    if let Err(e) =
      docker::volumes::remove_volume(&volume).await
    {
      warn!("failed to remove volume {volume} | {e:#}");
    }
  }
  crate::caddy::remove_project_route(&project.name).await?;
  for domain in domains::get_for_project(pool, &project.id).await?
  {
    crate::caddy::remove_apex_www_redirect(&domain.id).await?;
    domains::delete(pool, &domain.id).await?;
  }
  env_variables::delete_all_for_project(pool, &project.id)
    .await?;
  database::project_key_values::delete_all_for_project(
    pool,
    &project.id,
  )
  .await?;
  database::projects::delete(pool, &project.id).await?;
  info!("removed {}", project.log());
  Ok(())
}

/// The `DISCO_*` variables injected into every container belonging
/// to a deployment: services, crons, runs and cgi alike.
pub fn injected_env(
  deployment: &Deployment,
  service_name: &str,
  disco_host: &str,
) -> Vec<EnvVar> {
  let mut env = vec![
    EnvVar::new("DISCO_PROJECT_NAME", &deployment.project_name),
    EnvVar::new("DISCO_SERVICE_NAME", service_name),
    EnvVar::new("DISCO_HOST", disco_host),
    EnvVar::new(
      "DISCO_DEPLOYMENT_NUMBER",
      deployment.number.to_string(),
    ),
  ];
  if let Some(commit_hash) = &deployment.commit_hash {
    env.push(EnvVar::new("DISCO_COMMIT", commit_hash));
  }
  if let Some(domain) = &deployment.domain {
    env.push(EnvVar::new("DISCO_PROJECT_DOMAIN", domain));
  }
  env
}

/// Decrypted deployment env snapshot.
pub async fn decrypted_env(
  deployment_id: &str,
) -> anyhow::Result<Vec<EnvVar>> {
  let encrypted = deployments::get_env_variables(
    &db_client().pool,
    deployment_id,
  )
  .await?;
  encrypted
    .into_iter()
    .map(|env_var| {
      Ok(EnvVar {
        value: encryption::decrypt(&env_var.value)?,
        name: env_var.name,
      })
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use disco_client::entities::{
    deployment::DeploymentStatus, task::TaskStatus,
  };

  use super::*;
  use crate::state;

  async fn setup_project(name: &str) -> Project {
    state::init_test_db().await;
    database::projects::create(
      &db_client().pool,
      name,
      None,
      None,
      None,
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn create_deployment_allocates_and_queues() {
    let project = setup_project("engine-queue").await;
    let pool = &db_client().pool;
    let manifest = r#"{"version":"1.0","services":{"web":{}}}"#;
    let deployment = create_deployment(
      &project,
      Some(String::from("abc123")),
      Some(manifest.to_string()),
      None,
    )
    .await
    .unwrap();
    assert_eq!(deployment.number, 1);
    assert_eq!(deployment.status, DeploymentStatus::Queued);

    let stored = deployments::get_by_id(pool, &deployment.id)
      .await
      .unwrap()
      .unwrap();
    let task_id = stored.task_id.unwrap();
    let task = tasks::get_by_id(pool, &task_id)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
    assert!(task.body.contains(&deployment.id));

    let second =
      create_deployment(&project, None, None, None)
        .await
        .unwrap();
    assert_eq!(second.number, 2);
    assert_eq!(
      second.prev_deployment_id, None,
      "no COMPLETE predecessor yet"
    );
  }

  #[tokio::test]
  async fn invalid_manifest_is_rejected_before_any_write() {
    let project = setup_project("engine-invalid").await;
    let err = create_deployment(
      &project,
      None,
      Some(String::from(
        r#"{"version":"1.0","services":{"web":{"type":"vm"}}}"#,
      )),
      None,
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("invalid manifest"));
    let deployment =
      create_deployment(&project, None, None, None)
        .await
        .unwrap();
    assert_eq!(deployment.number, 1, "nothing was allocated");
  }

  #[tokio::test]
  async fn scale_validates_against_the_live_manifest() {
    let project = setup_project("engine-scale").await;
    let pool = &db_client().pool;
    let err = scale(&project, &[(String::from("web"), 2)])
      .await
      .unwrap_err();
    assert!(format!("{err:#}").contains("must deploy first"));

    let manifest = r#"{"version":"1.0","services":{
      "web":{},
      "worker":{"type":"cron","command":"tick","schedule":"* * * * *"}
    }}"#;
    let deployment = create_deployment(
      &project,
      None,
      Some(manifest.to_string()),
      None,
    )
    .await
    .unwrap();
    deployments::set_status(
      pool,
      &deployment.id,
      DeploymentStatus::Complete,
    )
    .await
    .unwrap();

    let err = scale(&project, &[(String::from("ghost"), 1)])
      .await
      .unwrap_err();
    assert!(format!("{err:#}").contains("not found"));
    let err = scale(&project, &[(String::from("worker"), 1)])
      .await
      .unwrap_err();
    assert!(format!("{err:#}").contains("not container"));
  }
}
