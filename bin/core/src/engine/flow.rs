//! The deployment pipeline.
//!
//! `process_deployment` drives one deployment from IN_PROGRESS to
//! COMPLETE, streaming every step into the deployment's output
//! source. On failure the same pipeline re-runs in recovery mode
//! with the roles swapped (predecessor as `new`, failed deployment
//! as `prev`); recovery wraps every step in log-and-continue so a
//! partial rollback never aborts the rollback.

use std::collections::HashSet;

use anyhow::Context;
use database::{deployments, key_values, outputs};
use disco_client::entities::{
  EnvVar,
  deployment::{DEPLOY_LATEST, Deployment, DeploymentStatus},
  manifest::{DiscoFile, ServiceType},
  project::volume_name_for_project,
};
use tokio::sync::mpsc::UnboundedSender;

use crate::{
  caddy,
  config::core_config,
  docker, engine, github,
  state::{db_client, output_stores, scheduler},
};

type LogSink = UnboundedSender<String>;

/// Everything the pipeline needs about one deployment, loaded in a
/// single snapshot so no database transaction is held across
/// external work.
#[derive(Debug, Clone)]
struct DeploymentInfo {
  id: String,
  number: i64,
  project_id: String,
  project_name: String,
  commit_hash: Option<String>,
  manifest: Option<DiscoFile>,
  github_repo: Option<String>,
  branch: Option<String>,
  github_installation_id: Option<i64>,
  registry_host: Option<String>,
  disco_host: String,
  domain: Option<String>,
  /// Decrypted snapshot.
  env_variables: Vec<EnvVar>,
}

impl DeploymentInfo {
  async fn load(
    deployment: &Deployment,
    disco_host: String,
  ) -> anyhow::Result<DeploymentInfo> {
    let pool = &db_client().pool;
    let manifest = deployment
      .disco_file
      .as_deref()
      .map(DiscoFile::parse)
      .transpose()?;
    let project = database::projects::get_by_id(
      pool,
      &deployment.project_id,
    )
    .await?;
    let env_variables =
      engine::decrypted_env(&deployment.id).await?;
    Ok(DeploymentInfo {
      id: deployment.id.clone(),
      number: deployment.number,
      project_id: deployment.project_id.clone(),
      project_name: deployment.project_name.clone(),
      commit_hash: deployment.commit_hash.clone(),
      manifest,
      github_repo: deployment.github_repo.clone(),
      branch: deployment.branch.clone(),
      github_installation_id: project
        .and_then(|p| p.github_installation_id),
      registry_host: deployment.registry_host.clone(),
      disco_host,
      domain: deployment.domain.clone(),
      env_variables,
    })
  }

  fn manifest(&self) -> anyhow::Result<&DiscoFile> {
    self.manifest.as_ref().context("manifest not resolved")
  }

  fn service_env(&self, service_name: &str) -> Vec<EnvVar> {
    let mut env = self.env_variables.clone();
    env.push(EnvVar::new(
      "DISCO_PROJECT_NAME",
      &self.project_name,
    ));
    env.push(EnvVar::new("DISCO_SERVICE_NAME", service_name));
    env.push(EnvVar::new("DISCO_HOST", &self.disco_host));
    env.push(EnvVar::new(
      "DISCO_DEPLOYMENT_NUMBER",
      self.number.to_string(),
    ));
    if let Some(commit_hash) = &self.commit_hash {
      env.push(EnvVar::new("DISCO_COMMIT", commit_hash));
    }
    if let Some(domain) = &self.domain {
      env.push(EnvVar::new("DISCO_PROJECT_DOMAIN", domain));
    }
    env
  }
}

fn say(log: &LogSink, text: impl Into<String>) {
  let _ = log.send(text.into());
}

/// Run a step, downgrading failure to a logged line in recovery
/// mode.
fn guard(
  recovery: bool,
  log: &LogSink,
  failure_line: &str,
  result: anyhow::Result<()>,
) -> anyhow::Result<()> {
  match result {
    Ok(()) => Ok(()),
    Err(e) if recovery => {
      warn!("{failure_line} | {e:#}");
      say(log, format!("{failure_line}\n"));
      Ok(())
    }
    Err(e) => Err(e),
  }
}

/// Entry point for the PROCESS_DEPLOYMENT task.
pub async fn process_deployment(
  deployment_id: &str,
) -> anyhow::Result<serde_json::Value> {
  let pool = &db_client().pool;
  let source = outputs::deployment_source(deployment_id);
  let (log, writer) = output_writer(source.clone());

  deployments::set_status(
    pool,
    deployment_id,
    DeploymentStatus::InProgress,
  )
  .await?;
  say(&log, "Starting deployment\n");

  let loaded = async {
    let deployment = deployments::get_by_id(pool, deployment_id)
      .await?
      .with_context(|| {
        format!("deployment {deployment_id} not found")
      })?;
    let disco_host =
      key_values::get_value(pool, key_values::DISCO_HOST)
        .await?
        .context("DISCO_HOST not set")?;
    let prev = deployments::get_live(pool, &deployment.project_id)
      .await?;
    let new_info =
      DeploymentInfo::load(&deployment, disco_host.clone()).await?;
    let prev_info = match prev {
      Some(prev) => {
        Some(DeploymentInfo::load(&prev, disco_host).await?)
      }
      None => None,
    };
    anyhow::Ok((new_info, prev_info))
  }
  .await;

  let (mut new_info, prev_info) = match loaded {
    Ok(infos) => infos,
    Err(e) => {
      error!("deployment {deployment_id} failed | {e:#}");
      say(&log, "Deployment failed\n");
      deployments::set_status(
        pool,
        deployment_id,
        DeploymentStatus::Failed,
      )
      .await?;
      finish_output(log, writer, &source).await;
      return Err(e);
    }
  };

  scheduler()
    .pause_project_crons(&new_info.project_name)
    .await;

  let result = replace_deployment(
    Some(&mut new_info),
    prev_info.as_ref(),
    false,
    &log,
  )
  .await;

  let status = match result {
    Ok(()) => {
      say(&log, "Deployment complete\n");
      deployments::set_status(
        pool,
        deployment_id,
        DeploymentStatus::Complete,
      )
      .await?;
      let prev_project_name =
        prev_info.as_ref().map(|info| info.project_name.clone());
      scheduler()
        .reload_and_resume_project_crons(
          prev_project_name.as_deref(),
          &new_info.project_name,
          new_info.number,
        )
        .await;
      "COMPLETE"
    }
    Err(e) => {
      error!("deployment {deployment_id} failed | {e:#}");
      deployments::set_status(
        pool,
        deployment_id,
        DeploymentStatus::Failed,
      )
      .await?;
      say(&log, format!("{e:#}\n"));
      say(&log, "Deployment failed.\n");
      say(&log, "Restoring previous deployment\n");
      let mut restored = prev_info.clone();
      if let Err(e) = replace_deployment(
        restored.as_mut(),
        Some(&new_info),
        true,
        &log,
      )
      .await
      {
        error!(
          "recovery failed for deployment {deployment_id} | {e:#}"
        );
        say(&log, "Failed to restore previous deployment\n");
      }
      if let Some(prev) = &prev_info {
        scheduler()
          .reload_and_resume_project_crons(
            Some(&prev.project_name),
            &prev.project_name,
            prev.number,
          )
          .await;
      } else {
        scheduler()
          .remove_project_crons(&new_info.project_name)
          .await;
      }
      "FAILED"
    }
  };
  info!("finished processing deployment {deployment_id}");
  finish_output(log, writer, &source).await;
  Ok(serde_json::json!({ "status": status }))
}

fn output_writer(
  source: String,
) -> (LogSink, tokio::task::JoinHandle<()>) {
  let (tx, mut rx) =
    tokio::sync::mpsc::unbounded_channel::<String>();
  let writer = tokio::spawn(async move {
    while let Some(text) = rx.recv().await {
      if let Err(e) =
        output_stores().store_output(&source, &text).await
      {
        error!("failed to persist output for {source} | {e:#}");
      }
    }
  });
  (tx, writer)
}

/// Drain the writer, then append the null sentinel so followers
/// stop.
async fn finish_output(
  log: LogSink,
  writer: tokio::task::JoinHandle<()>,
  source: &str,
) {
  drop(log);
  let _ = writer.await;
  if let Err(e) = output_stores().terminate(source).await {
    error!("failed to terminate output for {source} | {e:#}");
  }
}

async fn replace_deployment(
  mut new_info: Option<&mut DeploymentInfo>,
  prev_info: Option<&DeploymentInfo>,
  recovery: bool,
  log: &LogSink,
) -> anyhow::Result<()> {
  info!(
    "replacing deployment {:?} with {:?} (recovery: {recovery})",
    prev_info.map(|info| info.number),
    new_info.as_ref().map(|info| info.number),
  );
  if !recovery {
    let info = new_info
      .as_deref_mut()
      .context("non-recovery run requires a new deployment")?;
    if info.commit_hash.is_some() && info.github_repo.is_some() {
      checkout_commit(info, log).await?;
    }
    if info.manifest.is_none() {
      resolve_manifest(info, log).await?;
    }
    let images = build_images(info, log).await?;
    push_images(&images, log).await?;
    if let Some(web) = info.manifest()?.web()
      && web.service_type == ServiceType::Static
    {
      prepare_static_site(info, log).await?;
    }
  }
  if let Some(info) = new_info.as_deref() {
    create_networks(info, recovery, log).await?;
    stop_conflicting_port_services(info, prev_info, recovery, log)
      .await?;
    start_services(info, recovery, log).await?;
    let has_web = info
      .manifest
      .as_ref()
      .is_some_and(|manifest| manifest.web().is_some());
    if has_web && info.domain.is_some() {
      serve_new_deployment(info, recovery, log).await?;
    }
  }
  stop_prev_services(new_info.as_deref(), prev_info, recovery, log)
    .await?;
  remove_prev_networks(prev_info, recovery, log).await?;
  Ok(())
}

async fn checkout_commit(
  info: &mut DeploymentInfo,
  log: &LogSink,
) -> anyhow::Result<()> {
  let commit_hash = info
    .commit_hash
    .clone()
    .context("checkout without commit hash")?;
  let repo = info
    .github_repo
    .clone()
    .context("checkout without bound repo")?;
  say(log, format!("Deployment of git {commit_hash}\n"));
  let repo_dir = core_config().project_dir(&info.project_name);
  let repo_url =
    github::repo_url(&repo, info.github_installation_id).await?;
  if !repo_dir.is_dir() {
    say(log, format!("Cloning project from {repo}\n"));
    git::clone(&repo_url, &repo_dir, Some(log)).await?;
  } else {
    say(log, "Fetching latest commits from git repo\n");
    git::set_remote_url(&repo_dir, &repo_url).await?;
    git::fetch(&repo_dir, Some(log)).await?;
  }
  if commit_hash == DEPLOY_LATEST {
    let branch = match &info.branch {
      Some(branch) => branch.clone(),
      None => {
        // no branch configured: prefer main, else master
        if git::remote_branch_exists(&repo_dir, "main").await {
          String::from("main")
        } else {
          String::from("master")
        }
      }
    };
    info!(
      "deploying latest of branch {branch} for {}",
      info.project_name
    );
    say(
      log,
      format!("Checking out latest commit of {branch}\n"),
    );
    git::checkout_branch_latest(&repo_dir, &branch, Some(log))
      .await?;
  } else {
    say(log, format!("Checking out commit {commit_hash}\n"));
    git::checkout_commit(&repo_dir, &commit_hash, Some(log))
      .await?;
  }
  let resolved = git::head_commit_hash(&repo_dir).await?;
  if resolved != commit_hash {
    deployments::set_commit_hash(
      &db_client().pool,
      &info.id,
      &resolved,
    )
    .await?;
    info.commit_hash = Some(resolved);
  }
  Ok(())
}

async fn resolve_manifest(
  info: &mut DeploymentInfo,
  log: &LogSink,
) -> anyhow::Result<()> {
  say(log, "Reading Disco file from project folder\n");
  let path =
    core_config().project_dir(&info.project_name).join("disco.json");
  let manifest = match tokio::fs::read_to_string(&path).await {
    Ok(contents) => {
      say(log, "Found disco.json\n");
      DiscoFile::parse(&contents)?
    }
    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
      say(
        log,
        "No disco.json found, falling back to default config\n",
      );
      DiscoFile::default_manifest()
    }
    Err(e) => {
      return Err(e).context("failed to read disco.json");
    }
  };
  deployments::set_disco_file(
    &db_client().pool,
    &info.id,
    &serde_json::to_string(&manifest)?,
  )
  .await?;
  info.manifest = Some(manifest);
  Ok(())
}

async fn build_images(
  info: &DeploymentInfo,
  log: &LogSink,
) -> anyhow::Result<Vec<String>> {
  say(log, "Building images\n");
  let manifest = info.manifest()?;
  let mut built: Vec<String> = Vec::new();
  let mut seen: HashSet<String> = HashSet::new();
  for (service_name, service) in &manifest.services {
    // a static site with no build command has nothing to build
    if service.service_type == ServiceType::Static
      && service.command.is_none()
      && !manifest.images.contains_key(&service.image)
    {
      continue;
    }
    let Some(image_spec) = manifest.images.get(&service.image)
    else {
      continue;
    };
    if image_spec.pull.is_some() {
      // docker pulls pinned images when the service is created
      continue;
    }
    let image = docker::image_name(
      info.registry_host.as_deref(),
      &info.project_name,
      &service.image,
      info.number,
    );
    if !seen.insert(image.clone()) {
      continue;
    }
    say(
      log,
      format!("Building image of {service_name}: {image}\n"),
    );
    docker::build::build_image(
      &image,
      &core_config().project_dir(&info.project_name),
      image_spec.dockerfile(),
      image_spec.context(),
      log,
    )
    .await?;
    built.push(image);
  }
  Ok(built)
}

async fn push_images(
  images: &[String],
  log: &LogSink,
) -> anyhow::Result<()> {
  say(log, "Pushing images to Disco registry\n");
  for image in images {
    docker::build::push_image(image, log).await?;
  }
  Ok(())
}

async fn prepare_static_site(
  info: &DeploymentInfo,
  log: &LogSink,
) -> anyhow::Result<()> {
  let manifest = info.manifest()?;
  let web = manifest.web().context("static prep without web")?;
  say(log, "Copying static files\n");
  super::static_site::prepare(
    &info.project_name,
    &web.public_path,
    info.number,
  )
  .await
}

async fn create_networks(
  info: &DeploymentInfo,
  recovery: bool,
  log: &LogSink,
) -> anyhow::Result<()> {
  let network = docker::deployment_network_name(
    &info.project_name,
    info.number,
  );
  guard(
    recovery,
    log,
    &format!("Failed to create network {network}"),
    docker::networks::create_network(&network, &info.project_name)
      .await,
  )?;
  let has_web = info
    .manifest
    .as_ref()
    .is_some_and(|manifest| manifest.web().is_some());
  if has_web {
    let web_network = docker::deployment_web_network_name(
      &info.project_name,
      info.number,
    );
    guard(
      recovery,
      log,
      &format!("Failed to create network {web_network}"),
      docker::networks::create_network(
        &web_network,
        &info.project_name,
      )
      .await,
    )?;
    guard(
      recovery,
      log,
      &format!(
        "Failed to add network {web_network} to {}",
        docker::CADDY_CONTAINER
      ),
      docker::networks::add_network_to_container(
        docker::CADDY_CONTAINER,
        &web_network,
      )
      .await,
    )?;
  }
  Ok(())
}

/// Stop predecessor services whose published host ports collide
/// with the new deployment, before the new services bind them.
async fn stop_conflicting_port_services(
  new_info: &DeploymentInfo,
  prev_info: Option<&DeploymentInfo>,
  recovery: bool,
  log: &LogSink,
) -> anyhow::Result<()> {
  let Some(prev_info) = prev_info else {
    return Ok(());
  };
  let (Some(new_manifest), Some(prev_manifest)) =
    (&new_info.manifest, &prev_info.manifest)
  else {
    return Ok(());
  };
  let new_ports: HashSet<u16> = new_manifest
    .services
    .values()
    .filter(|s| s.service_type == ServiceType::Container)
    .flat_map(|s| &s.published_ports)
    .map(|p| p.published_as)
    .collect();
  for (service_name, service) in &prev_manifest.services {
    if service.service_type != ServiceType::Container {
      continue;
    }
    let conflicts = service
      .published_ports
      .iter()
      .any(|p| new_ports.contains(&p.published_as));
    if !conflicts {
      continue;
    }
    let qualified = docker::service_name(
      &prev_info.project_name,
      service_name,
      prev_info.number,
    );
    say(
      log,
      format!(
        "Stopping previous service {service_name} \
         (published port would conflict with new service)\n"
      ),
    );
    guard(
      recovery,
      log,
      &format!("Failed to stop service {service_name}"),
      docker::swarm::remove_service(&qualified).await,
    )?;
  }
  Ok(())
}

async fn start_services(
  info: &DeploymentInfo,
  recovery: bool,
  log: &LogSink,
) -> anyhow::Result<()> {
  say(log, "Starting services\n");
  let Some(manifest) = &info.manifest else {
    say(log, "No manifest available, not starting services\n");
    return Ok(());
  };
  for (service_name, service) in &manifest.services {
    if service.service_type != ServiceType::Container {
      continue;
    }
    let mut networks = vec![docker::deployment_network_name(
      &info.project_name,
      info.number,
    )];
    if service_name == "web" {
      networks.push(docker::deployment_web_network_name(
        &info.project_name,
        info.number,
      ));
    }
    let image = docker::image_for_service(
      manifest,
      service_name,
      info.registry_host.as_deref(),
      &info.project_name,
      info.number,
    )
    .context("service image unresolved")?;
    say(log, format!("Starting service {service_name}\n"));
    let spec = docker::swarm::ServiceSpec {
      name: docker::service_name(
        &info.project_name,
        service_name,
        info.number,
      ),
      image,
      project_name: info.project_name.clone(),
      service_name: service_name.clone(),
      deployment_number: info.number,
      env_variables: info.service_env(service_name),
      volumes: service
        .volumes
        .iter()
        .map(|v| {
          (
            volume_name_for_project(&v.name, &info.project_id),
            v.destination_path.clone(),
          )
        })
        .collect(),
      published_ports: service.published_ports.clone(),
      networks,
      replicas: None,
      command: service.command.clone(),
      health: service.health.as_ref().map(|h| h.command.clone()),
      resources: service.resources.clone(),
      registry_auth: info.registry_host.is_some(),
    };
    guard(
      recovery,
      log,
      &format!("Failed to start service {service_name}"),
      docker::swarm::create_service(&spec).await,
    )?;
  }
  Ok(())
}

/// The cutover. One proxy call and traffic flows to the new
/// deployment.
async fn serve_new_deployment(
  info: &DeploymentInfo,
  recovery: bool,
  log: &LogSink,
) -> anyhow::Result<()> {
  let Some(web) =
    info.manifest.as_ref().and_then(|manifest| manifest.web())
  else {
    return Ok(());
  };
  let result = if web.service_type == ServiceType::Container {
    say(log, "Sending traffic to new web service\n");
    caddy::point_to_container(
      &info.project_name,
      &docker::service_name(&info.project_name, "web", info.number),
      web.port,
    )
    .await
  } else {
    say(log, "Serving static site\n");
    caddy::point_to_static(&info.project_name, info.number).await
  };
  guard(
    recovery,
    log,
    &format!(
      "Failed to update Caddy to serve deployment {}",
      info.number
    ),
    result,
  )
}

/// Retire everything that is not part of the new deployment:
/// predecessor services and any leftover service of the project.
async fn stop_prev_services(
  new_info: Option<&DeploymentInfo>,
  prev_info: Option<&DeploymentInfo>,
  recovery: bool,
  log: &LogSink,
) -> anyhow::Result<()> {
  let Some(prev_info) = prev_info else {
    return Ok(());
  };
  let listed = async {
    let (all, current) = match new_info {
      None => (
        docker::swarm::list_services_for_project(
          &prev_info.project_name,
        )
        .await?,
        Vec::new(),
      ),
      Some(new_info) => {
        let mut all = docker::swarm::list_services_for_project(
          &new_info.project_name,
        )
        .await?;
        if prev_info.project_name != new_info.project_name {
          all.extend(
            docker::swarm::list_services_for_project(
              &prev_info.project_name,
            )
            .await?,
          );
        }
        let current =
          docker::swarm::list_services_for_deployment(
            &new_info.project_name,
            new_info.number,
          )
          .await?;
        (all, current)
      }
    };
    anyhow::Ok((all, current))
  }
  .await;
  let (all, current) = match listed {
    Ok(listed) => listed,
    Err(e) if recovery => {
      warn!("failed to list services to stop | {e:#}");
      say(log, "Failed to retrieve list of services to stop\n");
      return Ok(());
    }
    Err(e) => return Err(e),
  };
  let current: HashSet<String> = current.into_iter().collect();
  for service in all {
    if current.contains(&service) {
      continue;
    }
    guard(
      recovery,
      log,
      &format!("Failed to stop service {service}"),
      docker::swarm::remove_service(&service).await,
    )?;
  }
  Ok(())
}

async fn remove_prev_networks(
  prev_info: Option<&DeploymentInfo>,
  recovery: bool,
  log: &LogSink,
) -> anyhow::Result<()> {
  let Some(prev_info) = prev_info else {
    return Ok(());
  };
  let network = docker::deployment_network_name(
    &prev_info.project_name,
    prev_info.number,
  );
  guard(
    recovery,
    log,
    &format!("Failed to remove network {network}"),
    docker::networks::remove_network(&network).await,
  )?;
  let has_container_web = prev_info
    .manifest
    .as_ref()
    .and_then(|m| m.web())
    .is_some_and(|web| {
      web.service_type == ServiceType::Container
    });
  if has_container_web {
    let web_network = docker::deployment_web_network_name(
      &prev_info.project_name,
      prev_info.number,
    );
    guard(
      recovery,
      log,
      &format!(
        "Failed to remove network {web_network} from {}",
        docker::CADDY_CONTAINER
      ),
      docker::networks::remove_network_from_container(
        docker::CADDY_CONTAINER,
        &web_network,
      )
      .await,
    )?;
    guard(
      recovery,
      log,
      &format!("Failed to remove network {web_network}"),
      docker::networks::remove_network(&web_network).await,
    )?;
  }
  Ok(())
}
