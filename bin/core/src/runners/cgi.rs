//! CGI services: one HTTP request, one ephemeral container.
//!
//! The request body goes to stdin, RFC 3875 variables describe the
//! request, and stdout comes back as `status: <code> <reason>` plus
//! headers and body.

use anyhow::Context;
use database::key_values;
use disco_client::entities::{
  EnvVar, api_key::ApiKey, manifest::ServiceType, new_id,
  project::{Project, volume_name_for_project},
};

use crate::{docker, engine, state::db_client};

pub const CGI_LABEL: &str = "disco.cgi";

/// The transport-level request handed to [request_cgi].
#[derive(Debug, Clone, Default)]
pub struct CgiRequest {
  pub method: String,
  pub path_info: String,
  pub query_string: String,
  pub content_type: Option<String>,
  pub content_length: Option<String>,
  pub body: Vec<u8>,
  pub include_api_key: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CgiResponse {
  pub status_code: u16,
  pub headers: Vec<(String, String)>,
  pub body: String,
}

/// The script's output did not follow the CGI response format.
#[derive(Debug, thiserror::Error)]
#[error("invalid CGI response: {reason}\n{output}")]
pub struct CgiResponseError {
  pub reason: String,
  pub output: String,
}

/// Run one CGI request against a project's `type=cgi` service.
pub async fn request_cgi(
  project: &Project,
  service_name: &str,
  request: CgiRequest,
  by_api_key: &ApiKey,
) -> anyhow::Result<CgiResponse> {
  let (deployment, manifest) =
    super::live_deployment_context(project).await?;
  let service = manifest
    .services
    .get(service_name)
    .with_context(|| {
      format!("service {service_name} not found")
    })?;
  if service.service_type != ServiceType::Cgi {
    return Err(anyhow::anyhow!(
      "service {service_name} is {}, not cgi",
      service.service_type
    ));
  }
  let image = docker::image_for_service(
    &manifest,
    service_name,
    deployment.registry_host.as_deref(),
    &project.name,
    deployment.number,
  )
  .context("service image unresolved")?;

  let pool = &db_client().pool;
  let disco_host =
    key_values::get_value(pool, key_values::DISCO_HOST)
      .await?
      .unwrap_or_default();
  let mut env_variables =
    engine::decrypted_env(&deployment.id).await?;
  env_variables.extend(engine::injected_env(
    &deployment,
    service_name,
    &disco_host,
  ));
  if request.include_api_key {
    info!("including DISCO_API_KEY env variable");
    env_variables
      .push(EnvVar::new("DISCO_API_KEY", &by_api_key.id));
  }
  env_variables.extend(cgi_env_variables(&request));

  info!(
    "requesting CGI {} {}{} from {} {service_name}",
    request.method,
    request.path_info,
    request.query_string,
    project.name,
  );
  let spec = docker::run::EphemeralSpec {
    name: format!("{}-cgi.{}", project.name, new_id()),
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
    command: service.command.clone(),
    labels: vec![
      (String::from(CGI_LABEL), String::from("true")),
      (
        String::from(docker::PROJECT_LABEL),
        project.name.clone(),
      ),
      (
        String::from(docker::SERVICE_LABEL),
        service_name.to_string(),
      ),
    ],
    interactive: true,
    auto_remove: false,
  };

  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let collector = tokio::spawn(async move {
    let mut lines = Vec::new();
    while let Some(line) = rx.recv().await {
      lines.push(line);
    }
    lines.join("\n")
  });
  let result = docker::run::run_attached(
    &spec,
    Some(request.body),
    tx,
    Some(std::time::Duration::from_secs(service.timeout)),
  )
  .await;
  let output = collector.await.unwrap_or_default();
  result.with_context(|| {
    format!("CGI script failed:\n{output}")
  })?;
  let response = parse_cgi_response(&output)?;
  if response.status_code == 500 {
    // an internal script error is the caller's exception, raw
    // body attached
    return Err(anyhow::anyhow!(
      "error from CGI script:\n{}",
      response.body
    ));
  }
  Ok(response)
}

/// The RFC 3875 environment describing the request.
fn cgi_env_variables(request: &CgiRequest) -> Vec<EnvVar> {
  [
    ("AUTH_TYPE", String::new()),
    (
      "CONTENT_LENGTH",
      request.content_length.clone().unwrap_or_default(),
    ),
    (
      "CONTENT_TYPE",
      request.content_type.clone().unwrap_or_default(),
    ),
    ("GATEWAY_INTERFACE", String::from("CGI/1.1")),
    ("PATH_INFO", request.path_info.clone()),
    ("PATH_TRANSLATED", String::new()),
    ("QUERY_STRING", request.query_string.clone()),
    ("REMOTE_ADDR", String::new()),
    ("REMOTE_HOST", String::new()),
    ("REMOTE_IDENT", String::new()),
    ("REMOTE_USER", String::new()),
    ("REQUEST_METHOD", request.method.clone()),
    ("SCRIPT_NAME", String::new()),
    ("SERVER_NAME", String::new()),
    ("SERVER_PORT", String::from("80")),
    ("SERVER_PROTOCOL", String::from("HTTP/1.1")),
    ("SERVER_SOFTWARE", String::from("Disco")),
  ]
  .into_iter()
  .map(|(name, value)| EnvVar::new(name, value))
  .collect()
}

/// Parse `status: <code> <reason>\r\n<headers>\r\n\r\n<body>`.
/// The `status:` keyword is case-insensitive.
fn parse_cgi_response(
  output: &str,
) -> Result<CgiResponse, CgiResponseError> {
  let mut lines = output.lines();
  let status_line = lines.next().unwrap_or_default();
  let status_code = parse_status_line(status_line).ok_or_else(
    || CgiResponseError {
      reason: format!(
        "couldn't parse status from first line: {status_line}"
      ),
      output: output.to_string(),
    },
  )?;
  let mut headers = Vec::new();
  for line in lines.by_ref() {
    let line = line.trim_end_matches('\r');
    if line.trim().is_empty() {
      break;
    }
    let Some((name, value)) = line.split_once(": ") else {
      return Err(CgiResponseError {
        reason: format!("couldn't parse header: {line}"),
        output: output.to_string(),
      });
    };
    headers.push((name.to_string(), value.trim().to_string()));
  }
  let body = lines.collect::<Vec<_>>().join("\n");
  Ok(CgiResponse {
    status_code,
    headers,
    body,
  })
}

fn parse_status_line(line: &str) -> Option<u16> {
  let line = line.trim_end_matches('\r');
  let rest = line
    .get(..7)
    .filter(|prefix| prefix.eq_ignore_ascii_case("status:"))
    .map(|_| line[7..].trim_start())?;
  let (code, reason) = rest.split_once(' ')?;
  if reason.is_empty() || code.len() != 3 {
    return None;
  }
  code.parse().ok()
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_a_full_response() {
    let response = parse_cgi_response(
      "Status: 200 OK\r\nContent-Type: application/json\r\nX-Req-Id: a: b\r\n\r\n{\"ok\":true}",
    )
    .unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(
      response.headers,
      vec![
        (
          String::from("Content-Type"),
          String::from("application/json")
        ),
        (String::from("X-Req-Id"), String::from("a: b")),
      ]
    );
    assert_eq!(response.body, "{\"ok\":true}");
  }

  #[test]
  fn status_keyword_is_case_insensitive() {
    assert_eq!(
      parse_cgi_response("status: 404 Not Found\n\n")
        .unwrap()
        .status_code,
      404
    );
    assert_eq!(
      parse_cgi_response("STATUS: 301 Moved\n\n")
        .unwrap()
        .status_code,
      301
    );
  }

  #[test]
  fn missing_status_line_is_an_error() {
    let err =
      parse_cgi_response("Content-Type: text/html\n\nhello")
        .unwrap_err();
    assert!(err.reason.contains("couldn't parse status"));
  }

  #[test]
  fn malformed_header_is_an_error() {
    let err = parse_cgi_response(
      "Status: 200 OK\nnot-a-header\n\nbody",
    )
    .unwrap_err();
    assert!(err.reason.contains("couldn't parse header"));
  }

  #[test]
  fn multiline_bodies_survive() {
    let response = parse_cgi_response(
      "Status: 200 OK\n\nline one\nline two",
    )
    .unwrap();
    assert_eq!(response.body, "line one\nline two");
  }

  #[test]
  fn rfc_3875_environment() {
    let env = cgi_env_variables(&CgiRequest {
      method: String::from("POST"),
      path_info: String::from("/hooks/build"),
      query_string: String::from("force=1"),
      content_type: Some(String::from("application/json")),
      content_length: Some(String::from("14")),
      body: b"{\"force\":true}".to_vec(),
      include_api_key: false,
    });
    let get = |name: &str| {
      env
        .iter()
        .find(|v| v.name == name)
        .map(|v| v.value.clone())
        .unwrap()
    };
    assert_eq!(get("GATEWAY_INTERFACE"), "CGI/1.1");
    assert_eq!(get("REQUEST_METHOD"), "POST");
    assert_eq!(get("PATH_INFO"), "/hooks/build");
    assert_eq!(get("QUERY_STRING"), "force=1");
    assert_eq!(get("CONTENT_LENGTH"), "14");
    assert_eq!(get("SERVER_PORT"), "80");
    assert_eq!(get("SERVER_PROTOCOL"), "HTTP/1.1");
    assert_eq!(get("SERVER_SOFTWARE"), "Disco");
  }
}
