//! Reverse-proxy control plane.
//!
//! Caddy holds its own config as JSON behind an admin API on a
//! Unix-domain socket; this module is stateless and treats that
//! config as the source of truth. Each project is one route object
//! with a stable id, replaced atomically on upsert.

use anyhow::Context;
use hyper::{Body, Method, Request};
use serde_json::{Value, json};
use tokio::net::UnixStream;

use crate::config::core_config;

#[derive(Debug, thiserror::Error)]
#[error("caddy returned {status}: {body}")]
pub struct ProxyError {
  pub status: u16,
  pub body: String,
}

/// Where a project's fallback subroute sends traffic.
#[derive(Debug, Clone)]
pub enum Upstream {
  /// `<service>:<port>` of the deployment's web service.
  Container { service_name: String, port: u16 },
  /// Static docroot of a deployment.
  Static {
    project_name: String,
    deployment_number: i64,
  },
  /// No deployment yet; point at the daemon so requests get a
  /// sensible placeholder response.
  Daemon,
}

fn project_route_id(project_name: &str) -> String {
  format!("disco-project-{project_name}")
}

fn project_handler_id(project_name: &str) -> String {
  format!("disco-project-handler-{project_name}")
}

fn project_hosts_id(project_name: &str) -> String {
  format!("disco-project-hosts-{project_name}")
}

fn redirect_route_id(domain_id: &str) -> String {
  format!("disco-redirect-{domain_id}")
}

fn handler_json(project_name: &str, upstream: &Upstream) -> Value {
  let id = project_handler_id(project_name);
  match upstream {
    Upstream::Container { service_name, port } => json!({
      "@id": id,
      "handler": "reverse_proxy",
      "upstreams": [{"dial": format!("{service_name}:{port}")}],
    }),
    Upstream::Static {
      project_name,
      deployment_number,
    } => json!({
      "@id": id,
      "handler": "file_server",
      "root": core_config()
        .static_site_dir(project_name, *deployment_number),
    }),
    Upstream::Daemon => json!({
      "@id": id,
      "handler": "reverse_proxy",
      "upstreams": [{"dial": core_config().daemon_upstream}],
    }),
  }
}

fn project_route_json(
  project_name: &str,
  domains: &[String],
  upstream: &Upstream,
) -> Value {
  json!({
    "@id": project_route_id(project_name),
    "handle": [{
      "handler": "subroute",
      "routes": [
        {
          // CLI traffic to the daemon passes through every project
          // domain under /.disco
          "match": [{"path": ["/.disco*"]}],
          "handle": [{
            "handler": "reverse_proxy",
            "rewrite": {"strip_path_prefix": "/.disco"},
            "upstreams": [{"dial": core_config().daemon_upstream}],
          }],
        },
        {
          "handle": [handler_json(project_name, upstream)],
        },
      ],
    }],
    "match": [{
      "@id": project_hosts_id(project_name),
      "host": domains,
    }],
    "terminal": true,
  })
}

/// PUT the whole project route. Replacement is atomic on the caddy
/// side, so traffic never sees a half-updated route.
pub async fn upsert_project_route(
  project_name: &str,
  domains: &[String],
  upstream: &Upstream,
) -> anyhow::Result<()> {
  request(
    Method::PUT,
    "/config/apps/http/servers/disco/routes/0",
    Some(project_route_json(project_name, domains, upstream)),
  )
  .await?;
  Ok(())
}

pub async fn remove_project_route(
  project_name: &str,
) -> anyhow::Result<()> {
  delete_id(&project_route_id(project_name)).await
}

/// Retarget only the fallback handler. This is the cutover: one
/// PATCH switches every request after it to the new deployment.
pub async fn point_to_container(
  project_name: &str,
  service_name: &str,
  port: u16,
) -> anyhow::Result<()> {
  patch_handler(
    project_name,
    &Upstream::Container {
      service_name: service_name.to_string(),
      port,
    },
  )
  .await
}

pub async fn point_to_static(
  project_name: &str,
  deployment_number: i64,
) -> anyhow::Result<()> {
  patch_handler(
    project_name,
    &Upstream::Static {
      project_name: project_name.to_string(),
      deployment_number,
    },
  )
  .await
}

async fn patch_handler(
  project_name: &str,
  upstream: &Upstream,
) -> anyhow::Result<()> {
  request(
    Method::PATCH,
    &format!("/id/{}", project_handler_id(project_name)),
    Some(handler_json(project_name, upstream)),
  )
  .await?;
  Ok(())
}

/// Replace the host matcher after a domain add/remove.
pub async fn set_domains_for_project(
  project_name: &str,
  domains: &[String],
) -> anyhow::Result<()> {
  request(
    Method::PATCH,
    &format!("/id/{}", project_hosts_id(project_name)),
    Some(json!({
      "@id": project_hosts_id(project_name),
      "host": domains,
    })),
  )
  .await?;
  Ok(())
}

fn redirect_route_json(
  domain_id: &str,
  from_domain: &str,
  to_domain: &str,
) -> Value {
  json!({
    "@id": redirect_route_id(domain_id),
    "match": [{"host": [from_domain]}],
    "handle": [{
      "handler": "static_response",
      "status_code": 301,
      "headers": {
        "Location": [format!(
          "https://{to_domain}{{http.request.uri}}"
        )],
      },
    }],
    "terminal": true,
  })
}

/// Publish a `from → to` apex/www redirect owned by `domain_id`.
pub async fn add_apex_www_redirect(
  domain_id: &str,
  from_domain: &str,
  to_domain: &str,
) -> anyhow::Result<()> {
  request(
    Method::PUT,
    "/config/apps/http/servers/disco/routes/0",
    Some(redirect_route_json(domain_id, from_domain, to_domain)),
  )
  .await?;
  Ok(())
}

pub async fn remove_apex_www_redirect(
  domain_id: &str,
) -> anyhow::Result<()> {
  delete_id(&redirect_route_id(domain_id)).await
}

async fn delete_id(id: &str) -> anyhow::Result<()> {
  match request(Method::DELETE, &format!("/id/{id}"), None).await {
    Ok(_) => Ok(()),
    // already gone: removal is idempotent
    Err(e)
      if e
        .downcast_ref::<ProxyError>()
        .is_some_and(|e| e.status == 404) =>
    {
      Ok(())
    }
    Err(e) => Err(e),
  }
}

async fn request(
  method: Method,
  path: &str,
  body: Option<Value>,
) -> anyhow::Result<String> {
  let socket = &core_config().caddy_socket;
  let stream = UnixStream::connect(socket)
    .await
    .with_context(|| {
      format!("failed to connect to caddy socket {socket:?}")
    })?;
  let (mut sender, connection) =
    hyper::client::conn::handshake(stream)
      .await
      .context("caddy admin handshake failed")?;
  tokio::spawn(async move {
    if let Err(e) = connection.await {
      debug!("caddy admin connection closed | {e}");
    }
  });
  let builder = Request::builder()
    .method(method)
    .uri(path)
    .header("Host", "disco-caddy")
    .header("Accept", "application/json");
  let request = match body {
    Some(value) => builder
      .header("Content-Type", "application/json")
      .body(Body::from(value.to_string())),
    None => builder.body(Body::empty()),
  }
  .context("failed to build caddy admin request")?;
  let response = sender
    .send_request(request)
    .await
    .context("caddy admin request failed")?;
  let status = response.status();
  let bytes = hyper::body::to_bytes(response.into_body())
    .await
    .context("failed to read caddy admin response")?;
  let body = String::from_utf8_lossy(&bytes).into_owned();
  if status.is_success() {
    Ok(body)
  } else {
    Err(
      ProxyError {
        status: status.as_u16(),
        body,
      }
      .into(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn route_object_shape() {
    let route = project_route_json(
      "blog",
      &[String::from("blog.example.com")],
      &Upstream::Container {
        service_name: String::from("blog-web.2"),
        port: 8000,
      },
    );
    assert_eq!(route["@id"], "disco-project-blog");
    assert_eq!(
      route["match"][0]["@id"],
      "disco-project-hosts-blog"
    );
    assert_eq!(route["match"][0]["host"][0], "blog.example.com");
    let subroutes = &route["handle"][0]["routes"];
    assert_eq!(
      subroutes[0]["match"][0]["path"][0],
      "/.disco*"
    );
    let handler = &subroutes[1]["handle"][0];
    assert_eq!(handler["@id"], "disco-project-handler-blog");
    assert_eq!(
      handler["upstreams"][0]["dial"],
      "blog-web.2:8000"
    );
  }

  #[test]
  fn static_upstream_serves_docroot() {
    let handler = handler_json(
      "blog",
      &Upstream::Static {
        project_name: String::from("blog"),
        deployment_number: 1,
      },
    );
    assert_eq!(handler["handler"], "file_server");
    assert_eq!(handler["root"], "/disco/srv/blog/1");
  }

  #[test]
  fn redirect_route_shape() {
    let route =
      redirect_route_json("d1", "www.example.com", "example.com");
    assert_eq!(route["@id"], "disco-redirect-d1");
    assert_eq!(route["match"][0]["host"][0], "www.example.com");
    assert_eq!(route["handle"][0]["status_code"], 301);
    assert_eq!(
      route["handle"][0]["headers"]["Location"][0],
      "https://example.com{http.request.uri}"
    );
  }
}
