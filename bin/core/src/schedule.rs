//! The cooperative scheduler loop.
//!
//! One loop per process drives three task collections: fixed-cadence
//! disco crons (second/minute/hour/day maintenance), per-service
//! project crons derived from live deployments, and ad-hoc queue
//! tasks. Ticks align to UTC second boundaries; the in-process queue
//! is drained with whatever remains of the current second.

use anyhow::Context;
use chrono::{DateTime, Duration, DurationRound, Utc};
use croner::Cron;
use dashmap::DashMap;
use database::deployments;
use disco_client::entities::{
  EnvVar, deployment::Deployment, manifest::DiscoFile,
  manifest::ServiceType, new_id,
  project::volume_name_for_project,
};
use futures_util::future::BoxFuture;
use tokio::sync::{Mutex, mpsc};

use crate::{
  docker, engine,
  runners::{run as runs, shell as shells},
  state::{db_client, output_stores, syslogs_hub, tunnels_hub},
};

pub struct QueueTask {
  pub id: String,
  pub fut: BoxFuture<'static, ()>,
}

#[derive(Debug, thiserror::Error)]
#[error("no queue task with id {0}")]
pub struct TaskNotFound(pub String);

pub struct Scheduler {
  project_crons: Mutex<Vec<ProjectCron>>,
  queue_tx: mpsc::UnboundedSender<QueueTask>,
  queue_rx: Mutex<mpsc::UnboundedReceiver<QueueTask>>,
  queue_tasks: DashMap<String, tokio::task::AbortHandle>,
}

impl Default for Scheduler {
  fn default() -> Scheduler {
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    Scheduler {
      project_crons: Mutex::new(Vec::new()),
      queue_tx,
      queue_rx: Mutex::new(queue_rx),
      queue_tasks: DashMap::new(),
    }
  }
}

impl Scheduler {
  /// Hand an async task to the loop. It runs on the next tick;
  /// the returned id can cancel it.
  pub fn enqueue(
    &self,
    fut: impl Future<Output = ()> + Send + 'static,
  ) -> String {
    let task = QueueTask {
      id: new_id(),
      fut: Box::pin(fut),
    };
    let id = task.id.clone();
    if self.queue_tx.send(task).is_err() {
      error!("scheduler queue closed, dropping task");
    }
    id
  }

  /// Abort a running queue task. Cancellation stops the
  /// cooperative task, not any container it already started;
  /// external work is bounded by its own timeout.
  pub fn cancel_task(
    &self,
    task_id: &str,
  ) -> Result<(), TaskNotFound> {
    match self.queue_tasks.get(task_id) {
      Some(handle) => {
        handle.abort();
        Ok(())
      }
      None => Err(TaskNotFound(task_id.to_string())),
    }
  }

  pub async fn pause_project_crons(&self, project_name: &str) {
    for cron in self.project_crons.lock().await.iter_mut() {
      if cron.project_name == project_name {
        cron.paused = true;
      }
    }
  }

  pub async fn remove_project_crons(&self, project_name: &str) {
    info!("removing project crons for {project_name}");
    self
      .project_crons
      .lock()
      .await
      .retain(|cron| cron.project_name != project_name);
  }

  /// After a successful deploy: update surviving crons in place,
  /// drop the ones whose service disappeared, add new ones, and
  /// clear the paused flag on everything for the project.
  pub async fn reload_and_resume_project_crons(
    &self,
    prev_project_name: Option<&str>,
    project_name: &str,
    deployment_number: i64,
  ) {
    info!("reloading project crons of {project_name}");
    if let Err(e) = self
      .reload_project_crons_inner(
        prev_project_name.unwrap_or(project_name),
        project_name,
        deployment_number,
      )
      .await
    {
      error!(
        "failed to reload project crons of {project_name} | {e:#}"
      );
    }
    for cron in self.project_crons.lock().await.iter_mut() {
      if cron.project_name == project_name {
        cron.paused = false;
      }
    }
  }

  async fn reload_project_crons_inner(
    &self,
    prev_project_name: &str,
    project_name: &str,
    deployment_number: i64,
  ) -> anyhow::Result<()> {
    let pool = &db_client().pool;
    let project =
      database::projects::get_by_name(pool, project_name)
        .await?
        .with_context(|| {
          format!("project {project_name} not found")
        })?;
    let deployment = deployments::get_by_number(
      pool,
      &project.id,
      deployment_number,
    )
    .await?
    .with_context(|| {
      format!(
        "deployment {deployment_number} of {project_name} not found"
      )
    })?;
    let manifest = engine::manifest_or_default(
      deployment.disco_file.as_deref(),
    )?;
    let disco_host = database::key_values::get_value(
      pool,
      database::key_values::DISCO_HOST,
    )
    .await?
    .unwrap_or_default();
    let mut crons = self.project_crons.lock().await;
    let mut existing: Vec<String> = Vec::new();
    let mut kept: Vec<ProjectCron> = Vec::new();
    for mut cron in crons.drain(..) {
      if cron.project_name != prev_project_name {
        kept.push(cron);
        continue;
      }
      existing.push(cron.service_name.clone());
      if manifest.services.contains_key(&cron.service_name) {
        info!(
          "updating cron {project_name} {}",
          cron.service_name
        );
        if let Err(e) = cron
          .update_for_deployment(
            &manifest,
            &deployment,
            &disco_host,
          )
          .await
        {
          error!(
            "failed to update cron {project_name} {} | {e:#}",
            cron.service_name
          );
        }
        kept.push(cron);
      } else {
        info!(
          "removing cron {prev_project_name} {}",
          cron.service_name
        );
      }
    }
    for (service_name, service) in &manifest.services {
      if service.service_type != ServiceType::Cron {
        continue;
      }
      if existing.contains(service_name) {
        continue; // already updated above
      }
      info!("adding cron {project_name} {service_name}");
      match ProjectCron::from_deployment(
        service_name,
        &manifest,
        &deployment,
        &disco_host,
      )
      .await
      {
        Ok(cron) => kept.push(cron),
        Err(e) => error!(
          "failed to add project cron {project_name} \
           {service_name} {deployment_number} | {e:#}"
        ),
      }
    }
    *crons = kept;
    Ok(())
  }

  async fn load_project_crons(&self) {
    let pool = &db_client().pool;
    let loaded = async {
      let disco_host = database::key_values::get_value(
        pool,
        database::key_values::DISCO_HOST,
      )
      .await?
      .unwrap_or_default();
      let projects = database::projects::get_all(pool).await?;
      let mut crons = Vec::new();
      for project in projects {
        let Some(deployment) =
          deployments::get_live(pool, &project.id).await?
        else {
          continue;
        };
        let manifest = engine::manifest_or_default(
          deployment.disco_file.as_deref(),
        )?;
        for (service_name, service) in &manifest.services {
          if service.service_type != ServiceType::Cron {
            continue;
          }
          match ProjectCron::from_deployment(
            service_name,
            &manifest,
            &deployment,
            &disco_host,
          )
          .await
          {
            Ok(cron) => crons.push(cron),
            Err(e) => error!(
              "failed to load project cron {} {service_name} | {e:#}",
              project.name
            ),
          }
        }
      }
      anyhow::Ok(crons)
    }
    .await;
    match loaded {
      Ok(crons) => {
        info!("loaded {} project crons", crons.len());
        *self.project_crons.lock().await = crons;
      }
      Err(e) => error!("failed to load project crons | {e:#}"),
    }
  }

  /// The loop. Runs for the life of the process.
  ///
  /// Both processes run a loop (each owns its queue tasks and hub
  /// maintenance), but only the worker fires project crons — the
  /// engine reloads them in-process after each deploy, and firing
  /// them in two processes would double-run them.
  pub async fn run(&'static self, fire_project_crons: bool) {
    info!("starting scheduler");
    if fire_project_crons {
      self.load_project_crons().await;
    }
    let mut disco_crons = load_disco_crons();
    let mut queue_rx = self.queue_rx.lock().await;
    loop {
      let now = Utc::now();
      for cron in &mut disco_crons {
        if cron.next <= now {
          while cron.next <= now {
            cron.next += cron.delta;
          }
          tokio::spawn(run_disco_cron(cron.kind));
        }
      }
      let due: Vec<ProjectCron> = {
        let mut crons = self.project_crons.lock().await;
        let mut due = Vec::new();
        for cron in crons.iter_mut() {
          if cron.next <= now && !cron.paused {
            cron.schedule_next();
            due.push(cron.clone());
          }
        }
        due
      };
      for cron in due {
        tokio::spawn(async move {
          info!(
            "running cron {} {}",
            cron.project_name, cron.service_name
          );
          cron.run().await;
        });
      }
      // drain the queue with the remainder of this second
      let micros = 1_000_000u64.saturating_sub(
        Utc::now().timestamp_subsec_micros() as u64,
      );
      let wait = std::time::Duration::from_micros(micros);
      match tokio::time::timeout(wait, queue_rx.recv()).await {
        Ok(Some(task)) => {
          let task_id = task.id.clone();
          let handle = tokio::spawn(async move {
            debug!("running queue task");
            task.fut.await;
            debug!("done running queue task");
          });
          self
            .queue_tasks
            .insert(task_id.clone(), handle.abort_handle());
          tokio::spawn(async move {
            let _ = handle.await;
            crate::state::scheduler()
              .queue_tasks
              .remove(&task_id);
          });
        }
        Ok(None) => return,
        Err(_) => {} // tick boundary
      }
    }
  }
}

#[derive(Debug, Clone, Copy)]
enum DiscoCronKind {
  Second,
  Minute,
  Hour,
  Day,
}

struct DiscoCron {
  kind: DiscoCronKind,
  next: DateTime<Utc>,
  delta: Duration,
}

fn load_disco_crons() -> Vec<DiscoCron> {
  let now = Utc::now();
  let second = now
    .duration_trunc(Duration::seconds(1))
    .unwrap_or(now);
  let minute =
    now.duration_trunc(Duration::minutes(1)).unwrap_or(now);
  let hour = now.duration_trunc(Duration::hours(1)).unwrap_or(now);
  let day = now.duration_trunc(Duration::days(1)).unwrap_or(now);
  vec![
    DiscoCron {
      kind: DiscoCronKind::Second,
      next: second + Duration::seconds(1),
      delta: Duration::seconds(1),
    },
    DiscoCron {
      kind: DiscoCronKind::Minute,
      next: minute + Duration::minutes(1),
      delta: Duration::minutes(1),
    },
    DiscoCron {
      kind: DiscoCronKind::Hour,
      next: hour + Duration::hours(1),
      delta: Duration::hours(1),
    },
    DiscoCron {
      kind: DiscoCronKind::Day,
      next: day + Duration::days(1),
      delta: Duration::days(1),
    },
  ]
}

async fn run_disco_cron(kind: DiscoCronKind) {
  match kind {
    // the second cron only exists to keep the loop ticking
    DiscoCronKind::Second => {}
    DiscoCronKind::Minute => {
      info!("disco minute cron");
      tunnels_hub().stop_expired_tunnels().await;
    }
    DiscoCronKind::Hour => {
      info!("disco hour cron");
      output_stores().evict_idle().await;
      tunnels_hub().clean_up_rogue_tunnels().await;
      runs::clean_up_orphan_runs(false).await;
      shells::clean_up_orphan_shells(false).await;
    }
    DiscoCronKind::Day => {
      info!("disco day cron");
      syslogs_hub().clean_up_rogue_syslogs().await;
      if let Err(e) = docker::images::remove_unused_images().await
      {
        error!("failed to clean up images | {e:#}");
      }
      if let Err(e) = docker::build::builder_prune().await {
        error!("failed to prune builder | {e:#}");
      }
    }
  }
}

/// One `type=cron` service of a live deployment.
#[derive(Clone)]
pub struct ProjectCron {
  pub project_name: String,
  pub service_name: String,
  pub deployment_number: i64,
  pub image: String,
  pub env_variables: Vec<EnvVar>,
  pub volumes: Vec<(String, String)>,
  pub networks: Vec<String>,
  pub command: String,
  pub schedule: String,
  cron: Cron,
  next: DateTime<Utc>,
  paused: bool,
  pub timeout: u64,
}

impl ProjectCron {
  pub async fn from_deployment(
    service_name: &str,
    manifest: &DiscoFile,
    deployment: &Deployment,
    disco_host: &str,
  ) -> anyhow::Result<ProjectCron> {
    let (schedule, cron, fields) =
      cron_fields(service_name, manifest, deployment, disco_host)
        .await?;
    let next = cron
      .find_next_occurrence(&Utc::now(), false)
      .context("failed to compute next cron occurrence")?;
    Ok(ProjectCron {
      project_name: deployment.project_name.clone(),
      service_name: service_name.to_string(),
      schedule,
      cron,
      next,
      paused: false,
      deployment_number: fields.deployment_number,
      image: fields.image,
      env_variables: fields.env_variables,
      volumes: fields.volumes,
      networks: fields.networks,
      command: fields.command,
      timeout: fields.timeout,
    })
  }

  pub async fn update_for_deployment(
    &mut self,
    manifest: &DiscoFile,
    deployment: &Deployment,
    disco_host: &str,
  ) -> anyhow::Result<()> {
    let (schedule, cron, fields) = cron_fields(
      &self.service_name,
      manifest,
      deployment,
      disco_host,
    )
    .await?;
    self.project_name = deployment.project_name.clone();
    self.deployment_number = fields.deployment_number;
    self.image = fields.image;
    self.env_variables = fields.env_variables;
    self.volumes = fields.volumes;
    self.networks = fields.networks;
    self.command = fields.command;
    self.timeout = fields.timeout;
    if self.schedule != schedule {
      self.next = cron
        .find_next_occurrence(&Utc::now(), false)
        .context("failed to compute next cron occurrence")?;
      self.cron = cron;
      self.schedule = schedule;
    }
    Ok(())
  }

  fn schedule_next(&mut self) {
    match self.cron.find_next_occurrence(&Utc::now(), false) {
      Ok(next) => self.next = next,
      Err(e) => {
        error!(
          "failed to schedule cron {} {} | {e}",
          self.project_name, self.service_name
        );
        self.next = Utc::now() + Duration::minutes(1);
      }
    }
  }

  /// One firing: replace any container left from the previous
  /// firing, run to completion with the manifest timeout. Failures
  /// are logged, never retried; the next tick is the retry.
  pub async fn run(&self) {
    let name = docker::service_name(
      &self.project_name,
      &self.service_name,
      self.deployment_number,
    );
    if docker::run::container_exists(&name).await
      && let Err(e) = docker::run::remove_container(&name).await
    {
      error!("failed to remove stale cron container | {e:#}");
      return;
    }
    let spec = docker::run::EphemeralSpec {
      name,
      image: self.image.clone(),
      env_variables: self.env_variables.clone(),
      volumes: self.volumes.clone(),
      networks: self.networks.clone(),
      command: Some(self.command.clone()),
      labels: vec![
        (String::from("disco.cron"), String::from("true")),
        (
          String::from(docker::PROJECT_LABEL),
          self.project_name.clone(),
        ),
        (
          String::from(docker::SERVICE_LABEL),
          self.service_name.clone(),
        ),
      ],
      interactive: false,
      auto_remove: false,
    };
    let (discard, mut discard_rx) =
      tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
      while discard_rx.recv().await.is_some() {}
    });
    let result = docker::run::run_attached(
      &spec,
      None,
      discard,
      Some(std::time::Duration::from_secs(self.timeout)),
    )
    .await;
    if let Err(e) = result {
      if e.downcast_ref::<command::CommandTimeout>().is_some() {
        info!(
          "cron timed out {} {} after {} seconds",
          self.project_name, self.service_name, self.timeout
        );
      } else {
        info!(
          "cron did not complete successfully {} {} | {e:#}",
          self.project_name, self.service_name
        );
      }
    }
  }
}

struct CronFields {
  deployment_number: i64,
  image: String,
  env_variables: Vec<EnvVar>,
  volumes: Vec<(String, String)>,
  networks: Vec<String>,
  command: String,
  timeout: u64,
}

async fn cron_fields(
  service_name: &str,
  manifest: &DiscoFile,
  deployment: &Deployment,
  disco_host: &str,
) -> anyhow::Result<(String, Cron, CronFields)> {
  let service = manifest
    .services
    .get(service_name)
    .with_context(|| {
      format!("service {service_name} not in manifest")
    })?;
  let schedule = service
    .schedule
    .clone()
    .context("cron service has no schedule")?;
  let cron = <Cron as std::str::FromStr>::from_str(&schedule)
    .context("failed to parse cron schedule")?;
  let command = service
    .command
    .clone()
    .context("cron service has no command")?;
  let image = docker::image_for_service(
    manifest,
    service_name,
    deployment.registry_host.as_deref(),
    &deployment.project_name,
    deployment.number,
  )
  .context("cron image unresolved")?;
  let mut env_variables =
    engine::decrypted_env(&deployment.id).await?;
  env_variables.extend(engine::injected_env(
    deployment,
    service_name,
    disco_host,
  ));
  let volumes = service
    .volumes
    .iter()
    .map(|v| {
      (
        volume_name_for_project(&v.name, &deployment.project_id),
        v.destination_path.clone(),
      )
    })
    .collect();
  let networks = vec![
    docker::deployment_network_name(
      &deployment.project_name,
      deployment.number,
    ),
    String::from(docker::MAIN_NETWORK),
  ];
  Ok((
    schedule,
    cron,
    CronFields {
      deployment_number: deployment.number,
      image,
      env_variables,
      volumes,
      networks,
      command,
      timeout: service.timeout,
    },
  ))
}

#[cfg(test)]
mod tests {
  use super::*;
  use disco_client::entities::{
    deployment::DeploymentStatus, disco_timestamp,
  };

  fn deployment(number: i64) -> Deployment {
    Deployment {
      id: new_id(),
      project_id: String::from("p1"),
      number,
      status: DeploymentStatus::Complete,
      commit_hash: Some(String::from("abc123")),
      disco_file: None,
      project_name: String::from("api"),
      registry_host: None,
      domain: None,
      github_repo: None,
      branch: None,
      prev_deployment_id: None,
      by_api_key_id: None,
      task_id: None,
      created: disco_timestamp(),
    }
  }

  fn manifest(schedule: &str) -> DiscoFile {
    DiscoFile::parse(&format!(
      r#"{{"version":"1.0","services":{{
        "worker":{{"type":"cron","command":"python tick.py",
                   "schedule":"{schedule}"}}}}}}"#,
    ))
    .unwrap()
  }

  // from_deployment needs the deployment env snapshot; these tests
  // run against an empty in-memory store so the snapshot is empty.
  async fn init_db() {
    crate::state::init_test_db().await;
  }

  #[tokio::test]
  async fn next_fire_follows_the_schedule() {
    init_db().await;
    let cron = ProjectCron::from_deployment(
      "worker",
      &manifest("*/5 * * * *"),
      &deployment(1),
      "disco.example.com",
    )
    .await
    .unwrap();
    assert_eq!(cron.next.timestamp() % 300, 0);
    assert!(cron.next > Utc::now());
    assert_eq!(
      cron.networks,
      vec![String::from("api-network-1"), String::from("disco-main")]
    );
    assert_eq!(cron.image, "disco/project-api-default:1");
  }

  #[tokio::test]
  async fn schedule_change_resets_next_fire() {
    init_db().await;
    let mut cron = ProjectCron::from_deployment(
      "worker",
      &manifest("*/5 * * * *"),
      &deployment(1),
      "disco.example.com",
    )
    .await
    .unwrap();
    let old_next = cron.next;
    // same schedule on a new deployment keeps the fire time
    cron
      .update_for_deployment(
        &manifest("*/5 * * * *"),
        &deployment(2),
        "disco.example.com",
      )
      .await
      .unwrap();
    assert_eq!(cron.next, old_next);
    assert_eq!(cron.deployment_number, 2);
    assert_eq!(cron.image, "disco/project-api-default:2");
    // a changed schedule recomputes it
    cron
      .update_for_deployment(
        &manifest("* * * * *"),
        &deployment(3),
        "disco.example.com",
      )
      .await
      .unwrap();
    assert_eq!(cron.schedule, "* * * * *");
    assert!(cron.next.timestamp() % 60 == 0);
  }
}
