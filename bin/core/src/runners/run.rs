//! Command runs: one-off commands executed in a fresh container
//! carrying a live deployment's image and environment.

use anyhow::Context;
use chrono::Utc;
use database::{command_runs, key_values, outputs};
use disco_client::entities::{
  EnvVar,
  api_key::ApiKey,
  command_run::{CommandRun, CommandRunStatus},
  manifest::ServiceType,
  project::{Project, volume_name_for_project},
};

use crate::{
  docker, engine,
  state::{db_client, output_stores},
};

pub const RUN_LABEL: &str = "disco.run";
pub const RUN_EXPIRES_LABEL: &str = "disco.run.expires";

/// Margin past the command timeout before the TTL sweep may
/// reclaim the container.
const EXPIRY_MARGIN_SECS: i64 = 3600;

/// Deferred start for a created run. The caller decides when to
/// fire it, typically by handing it to the scheduler queue.
#[derive(Debug)]
pub struct CommandRunStarter {
  spec: docker::run::EphemeralSpec,
  run_id: String,
  project_name: String,
  number: i64,
  timeout: u64,
  interactive: bool,
}

/// Create a CommandRun row plus its starter.
///
/// The container is `docker create`d rather than run so an attach
/// endpoint can later `docker start --attach --interactive` it and
/// bridge stdio. Expired or never-started containers are reclaimed
/// by the hourly sweep via their TTL label.
pub async fn create_command_run(
  project: &Project,
  service_name: &str,
  command: &str,
  timeout: u64,
  interactive: bool,
  include_api_key: bool,
  by_api_key: &ApiKey,
) -> anyhow::Result<(CommandRun, CommandRunStarter)> {
  let (deployment, manifest) =
    super::live_deployment_context(project).await?;
  let service = super::runnable_service(&manifest, service_name)?;

  let pool = &db_client().pool;
  let mut conn = pool.acquire().await?;
  let run = command_runs::create(
    &mut conn,
    &project.id,
    &deployment.id,
    service_name,
    command,
    &by_api_key.id,
  )
  .await?;
  drop(conn);

  let image = docker::image_for_service(
    &manifest,
    service_name,
    deployment.registry_host.as_deref(),
    &project.name,
    deployment.number,
  )
  .context("service image unresolved")?;
  // command services define a base command the given text extends
  let command =
    if service.service_type == ServiceType::Command {
      let base = service
        .command
        .as_deref()
        .context("command service has no command")?;
      format!("{base} {command}")
    } else {
      command.to_string()
    };

  let disco_host = key_values::get_value(pool, key_values::DISCO_HOST)
    .await?
    .unwrap_or_default();
  let mut env_variables =
    engine::decrypted_env(&deployment.id).await?;
  env_variables.extend(engine::injected_env(
    &deployment,
    service_name,
    &disco_host,
  ));
  if let Some(ip) =
    key_values::get_value(pool, key_values::DISCO_IP).await?
  {
    env_variables.push(EnvVar::new("DISCO_IP", ip));
  }
  if include_api_key {
    info!("including DISCO_API_KEY env variable");
    env_variables
      .push(EnvVar::new("DISCO_API_KEY", &by_api_key.id));
  }

  let expires =
    Utc::now().timestamp() + timeout as i64 + EXPIRY_MARGIN_SECS;
  let spec = docker::run::EphemeralSpec {
    name: format!("{}-run.{}", project.name, run.number),
    image,
    env_variables,
    volumes: service
      .volumes
      .iter()
      .map(|v| {
        (
          volume_name_for_project(&v.name, &project.id),
          v.destination_path.clone(),
        )
      })
      .collect(),
    networks: vec![
      docker::deployment_network_name(
        &project.name,
        deployment.number,
      ),
      String::from(docker::MAIN_NETWORK),
    ],
    command: Some(command),
    labels: vec![
      (String::from(RUN_LABEL), String::from("true")),
      (
        String::from(RUN_EXPIRES_LABEL),
        expires.to_string(),
      ),
      (
        String::from(docker::PROJECT_LABEL),
        project.name.clone(),
      ),
      (
        String::from(docker::SERVICE_LABEL),
        service_name.to_string(),
      ),
    ],
    interactive,
    auto_remove: false,
  };
  let starter = CommandRunStarter {
    spec,
    run_id: run.id.clone(),
    project_name: project.name.clone(),
    number: run.number,
    timeout,
    interactive,
  };
  Ok((run, starter))
}

impl CommandRunStarter {
  /// The name of the container this starter creates.
  pub fn container_name(&self) -> &str {
    &self.spec.name
  }

  /// Create the container, and for non-interactive runs drive it
  /// to completion, streaming output into the run's source. For
  /// interactive runs the attach endpoint starts the container.
  pub async fn start(self) {
    let pool = &db_client().pool;
    let source = outputs::run_source(&self.run_id);
    let fail = |text: &str| {
      warn!(
        "command run {} {} failed: {text}",
        self.project_name, self.number
      )
    };
    if let Err(e) =
      docker::run::create_container(&self.spec).await
    {
      fail(&format!("{e:#}"));
      let _ = output_stores()
        .store_output(&source, "Failed\n")
        .await;
      let _ = output_stores().terminate(&source).await;
      let _ = command_runs::set_status(
        pool,
        &self.run_id,
        CommandRunStatus::Failed,
      )
      .await;
      return;
    }
    let _ = command_runs::set_status(
      pool,
      &self.run_id,
      CommandRunStatus::Started,
    )
    .await;
    if self.interactive {
      // attach-driven; the TTL sweep reclaims it if nothing does
      return;
    }

    let (tx, mut rx) =
      tokio::sync::mpsc::unbounded_channel::<String>();
    let writer = {
      let source = source.clone();
      let project_name = self.project_name.clone();
      let number = self.number;
      tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
          info!("command run {project_name} {number}: {line}");
          if let Err(e) = output_stores()
            .store_output(&source, &format!("{line}\n"))
            .await
          {
            error!("failed to persist run output | {e:#}");
          }
        }
      })
    };
    let result = docker::run::start_attached(
      &self.spec.name,
      None,
      tx,
      Some(std::time::Duration::from_secs(self.timeout)),
    )
    .await;
    let _ = writer.await;
    let status = match result {
      Ok(()) => CommandRunStatus::Done,
      Err(e) => {
        fail(&format!("{e:#}"));
        let _ = output_stores()
          .store_output(&source, "Failed\n")
          .await;
        CommandRunStatus::Failed
      }
    };
    let _ = output_stores().terminate(&source).await;
    let _ = docker::run::remove_container(&self.spec.name).await;
    let _ =
      command_runs::set_status(pool, &self.run_id, status).await;
  }
}

/// Remove run containers that expired, or all of them on startup
/// (anything predating the process is an orphan by definition).
pub async fn clean_up_orphan_runs(remove_all: bool) {
  debug!(
    "checking for orphaned run containers (remove_all={remove_all})"
  );
  let containers = match docker::run::list_labeled_containers(
    &format!("{RUN_LABEL}=true"),
    RUN_EXPIRES_LABEL,
  )
  .await
  {
    Ok(containers) => containers,
    Err(e) => {
      error!("failed to list run containers | {e:#}");
      return;
    }
  };
  let now = Utc::now().timestamp();
  let mut removed = 0usize;
  for (name, expires) in containers {
    let expired = match expires {
      Some(expires) => now > expires,
      // missing TTL label: reclaim, it cannot be tracked
      None => true,
    };
    if remove_all || expired {
      info!("removing orphaned run container {name}");
      if let Err(e) =
        docker::run::remove_container(&name).await
      {
        warn!("failed to remove run container {name} | {e:#}");
      } else {
        removed += 1;
      }
    }
  }
  if removed > 0 {
    info!("cleaned up {removed} run containers");
  }
}

#[cfg(test)]
mod tests {
  use disco_client::entities::deployment::DeploymentStatus;

  use super::*;
  use crate::{engine, state};

  async fn deployed_project(
    name: &str,
  ) -> (Project, ApiKey) {
    state::init_test_db().await;
    let pool = &db_client().pool;
    let project = database::projects::create(
      pool, name, None, None, None,
    )
    .await
    .unwrap();
    let api_key =
      database::api_keys::create(pool, "cli").await.unwrap();
    let manifest = r#"{"version":"1.0","services":{
      "web":{},
      "assets":{"type":"static"},
      "manage":{"type":"command","command":"python manage.py"}
    }}"#;
    let deployment = engine::create_deployment(
      &project,
      None,
      Some(manifest.to_string()),
      None,
    )
    .await
    .unwrap();
    database::deployments::set_status(
      pool,
      &deployment.id,
      DeploymentStatus::Complete,
    )
    .await
    .unwrap();
    (project, api_key)
  }

  #[tokio::test]
  async fn runs_number_per_project_and_name_containers() {
    let (project, api_key) =
      deployed_project("runner-numbers").await;
    let (run, starter) = create_command_run(
      &project, "web", "ls -la", 300, false, false, &api_key,
    )
    .await
    .unwrap();
    assert_eq!(run.number, 1);
    assert_eq!(
      starter.container_name(),
      "runner-numbers-run.1"
    );
    let (run, _) = create_command_run(
      &project, "web", "env", 300, false, false, &api_key,
    )
    .await
    .unwrap();
    assert_eq!(run.number, 2);
  }

  #[tokio::test]
  async fn command_services_prefix_the_base_command() {
    let (project, api_key) =
      deployed_project("runner-prefix").await;
    let (_, starter) = create_command_run(
      &project, "manage", "migrate", 300, false, false, &api_key,
    )
    .await
    .unwrap();
    assert_eq!(
      starter.spec.command.as_deref(),
      Some("python manage.py migrate")
    );
  }

  #[tokio::test]
  async fn static_and_unknown_services_are_rejected() {
    let (project, api_key) =
      deployed_project("runner-static").await;
    let err = create_command_run(
      &project, "assets", "ls", 300, false, false, &api_key,
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("static"));
    let err = create_command_run(
      &project, "ghost", "ls", 300, false, false, &api_key,
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("not found"));
  }

  #[tokio::test]
  async fn runs_require_a_live_deployment() {
    state::init_test_db().await;
    let pool = &db_client().pool;
    let project = database::projects::create(
      pool,
      "runner-undeployed",
      None,
      None,
      None,
    )
    .await
    .unwrap();
    let api_key =
      database::api_keys::create(pool, "cli2").await.unwrap();
    let err = create_command_run(
      &project, "web", "ls", 300, false, false, &api_key,
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("must deploy first"));
  }
}
