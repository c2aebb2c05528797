//! Project domain management, including the apex⇄www auto-redirect
//! rule: when a project owns `example.com` and nobody owns
//! `www.example.com`, a redirect is published from the free name to
//! the owned one (and mirrored the other way). Re-evaluated on
//! every add and remove so at most one of the pair ever redirects.

use anyhow::Context;
use database::{deployments, domains as domain_rows};
use disco_client::entities::{
  domain::{ProjectDomain, apex_www_counterpart},
  manifest::ServiceType,
  project::Project,
};

use crate::{
  caddy, docker, engine,
  state::{db_client, events_hub},
};

#[derive(Debug, thiserror::Error)]
#[error("domain {0} already taken")]
pub struct DomainTaken(pub String);

pub async fn add_domain(
  project: &Project,
  domain_name: &str,
) -> anyhow::Result<ProjectDomain> {
  let pool = &db_client().pool;
  if domain_rows::get_by_name(pool, domain_name).await?.is_some()
  {
    return Err(DomainTaken(domain_name.to_string()).into());
  }
  let domain =
    domain_rows::create(pool, &project.id, domain_name).await?;
  info!("added domain {domain_name} to {}", project.log());

  let counterpart_name = apex_www_counterpart(domain_name);
  let counterpart = match &counterpart_name {
    Some(name) => domain_rows::get_by_name(pool, name).await?,
    None => None,
  };
  if let Some(counterpart) = &counterpart {
    // the name we just claimed was redirecting to its counterpart
    info!(
      "removing domain redirect from {domain_name} to {}",
      counterpart.name
    );
    caddy::remove_apex_www_redirect(&counterpart.id).await?;
  }
  let domains = update_proxy_domains(project).await?;
  if let Some(counterpart_name) = counterpart_name
    && counterpart.is_none()
  {
    // counterpart is free: redirect it here
    info!(
      "adding domain redirect from {counterpart_name} to {domain_name}"
    );
    caddy::add_apex_www_redirect(
      &domain.id,
      &counterpart_name,
      domain_name,
    )
    .await?;
  }
  if domains.len() == 1 {
    serve_live_deployment(project).await?;
  }
  events_hub().domain_created(&project.name, domain_name);
  Ok(domain)
}

pub async fn remove_domain(
  project: &Project,
  domain: &ProjectDomain,
) -> anyhow::Result<()> {
  let pool = &db_client().pool;
  domain_rows::delete(pool, &domain.id).await?;
  info!(
    "removed domain {} from {}",
    domain.name,
    project.log()
  );
  events_hub().domain_removed(&project.name, &domain.name);
  update_proxy_domains(project).await?;
  if let Some(counterpart_name) = apex_www_counterpart(&domain.name)
  {
    match domain_rows::get_by_name(pool, &counterpart_name).await? {
      None => {
        // we were the redirect target; drop our redirect
        info!(
          "removing domain redirect from {counterpart_name} to {}",
          domain.name
        );
        caddy::remove_apex_www_redirect(&domain.id).await?;
      }
      Some(counterpart) => {
        // the name we freed can now redirect to its counterpart
        info!(
          "adding domain redirect from {} to {}",
          domain.name, counterpart.name
        );
        caddy::add_apex_www_redirect(
          &counterpart.id,
          &domain.name,
          &counterpart.name,
        )
        .await?;
      }
    }
  }
  Ok(())
}

/// Push the project's current domain set to the proxy. With no
/// domains left the whole route comes down; with a fresh first
/// domain it is created pointing at the daemon until cutover.
async fn update_proxy_domains(
  project: &Project,
) -> anyhow::Result<Vec<String>> {
  let pool = &db_client().pool;
  let domains: Vec<String> =
    domain_rows::get_for_project(pool, &project.id)
      .await?
      .into_iter()
      .map(|domain| domain.name)
      .collect();
  if domains.is_empty() {
    caddy::remove_project_route(&project.name).await?;
  } else {
    caddy::upsert_project_route(
      &project.name,
      &domains,
      &current_upstream(project).await?,
    )
    .await?;
  }
  Ok(domains)
}

/// The upstream the route should carry right now: the live web
/// service when there is one, the daemon placeholder otherwise.
async fn current_upstream(
  project: &Project,
) -> anyhow::Result<caddy::Upstream> {
  let pool = &db_client().pool;
  let Some(deployment) =
    deployments::get_live(pool, &project.id).await?
  else {
    return Ok(caddy::Upstream::Daemon);
  };
  let manifest =
    engine::manifest_or_default(deployment.disco_file.as_deref())?;
  let Some(web) = manifest.web() else {
    return Ok(caddy::Upstream::Daemon);
  };
  Ok(match web.service_type {
    ServiceType::Static => caddy::Upstream::Static {
      project_name: project.name.clone(),
      deployment_number: deployment.number,
    },
    _ => caddy::Upstream::Container {
      service_name: docker::service_name(
        &project.name,
        "web",
        deployment.number,
      ),
      port: web.port,
    },
  })
}

/// Route traffic at whatever is currently live, used when the
/// first domain appears after a deployment already happened.
pub async fn serve_live_deployment(
  project: &Project,
) -> anyhow::Result<()> {
  let pool = &db_client().pool;
  let Some(deployment) =
    deployments::get_live(pool, &project.id).await?
  else {
    return Ok(()); // nothing to serve
  };
  let manifest =
    engine::manifest_or_default(deployment.disco_file.as_deref())?;
  let Some(web) = manifest.web() else {
    return Ok(());
  };
  match web.service_type {
    ServiceType::Container => {
      caddy::point_to_container(
        &project.name,
        &docker::service_name(
          &project.name,
          "web",
          deployment.number,
        ),
        web.port,
      )
      .await
    }
    ServiceType::Static => {
      caddy::point_to_static(&project.name, deployment.number)
        .await
    }
    _ => Ok(()),
  }
  .context("failed to serve live deployment")
}
