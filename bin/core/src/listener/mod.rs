//! GitHub App webhook intake.
//!
//! The daemon verifies the delivery signature against the target
//! app's stored secret and enqueues a PROCESS_GITHUB_WEBHOOK task;
//! the worker then dispatches the event. Nothing touches the
//! database before the signature checks out.

use anyhow::Context;
use database::{github_apps, tasks};
use disco_client::entities::{
  deployment::DEPLOY_LATEST,
  task::{ProcessGithubWebhookBody, TaskName},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{encryption, engine, github, state::db_client};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
#[error("webhook signature mismatch")]
pub struct WebhookSignatureMismatch;

/// Delivery metadata from the `X-GitHub-*` / `X-Hub-*` headers.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
  pub event: Option<String>,
  pub signature_256: Option<String>,
  pub installation_target_type: Option<String>,
  pub installation_target_id: Option<String>,
}

/// Verify and enqueue a GitHub App delivery.
///
/// Deliveries with missing or unusable metadata are dropped with a
/// warning (GitHub retries are signed the same way, so there is
/// nothing to recover). A present-but-wrong signature is an error
/// and has no side effects.
pub async fn process_github_app_webhook(
  headers: &WebhookHeaders,
  body: &[u8],
) -> anyhow::Result<()> {
  let Some(event) = &headers.event else {
    warn!("X-GitHub-Event not provided, skipping");
    return Ok(());
  };
  let Some(signature) = &headers.signature_256 else {
    warn!("X-Hub-Signature-256 not provided, skipping");
    return Ok(());
  };
  match &headers.installation_target_type {
    Some(target_type) if target_type == "integration" => {}
    _ => {
      warn!(
        "X-GitHub-Hook-Installation-Target-Type not 'integration', skipping"
      );
      return Ok(());
    }
  }
  let Some(app_id) = headers
    .installation_target_id
    .as_deref()
    .and_then(|id| id.parse::<i64>().ok())
  else {
    warn!(
      "X-GitHub-Hook-Installation-Target-ID not usable, skipping"
    );
    return Ok(());
  };

  let pool = &db_client().pool;
  let Some(app) = github_apps::get_app_by_id(pool, app_id).await?
  else {
    warn!("no GitHub app with id {app_id}, skipping");
    return Ok(());
  };
  let webhook_secret = encryption::decrypt(&app.webhook_secret)?;
  verify_signature(webhook_secret.as_bytes(), body, signature)?;
  debug!("X-Hub-Signature-256 signature matched, continuing");

  tasks::enqueue(
    pool,
    TaskName::ProcessGithubWebhook,
    &ProcessGithubWebhookBody {
      app_id,
      event: event.clone(),
      request_body: String::from_utf8_lossy(body).into_owned(),
    },
  )
  .await?;
  Ok(())
}

/// Constant-time comparison of `sha256=<hex>` against the body HMAC.
fn verify_signature(
  secret: &[u8],
  body: &[u8],
  signature_header: &str,
) -> Result<(), WebhookSignatureMismatch> {
  let Some(signature_hex) =
    signature_header.strip_prefix("sha256=")
  else {
    return Err(WebhookSignatureMismatch);
  };
  let Ok(expected) = hex::decode(signature_hex) else {
    return Err(WebhookSignatureMismatch);
  };
  let mut mac = HmacSha256::new_from_slice(secret)
    .expect("HMAC accepts any key length");
  mac.update(body);
  mac
    .verify_slice(&expected)
    .map_err(|_| WebhookSignatureMismatch)
}

/// Worker-side dispatch of a verified delivery.
pub async fn process_webhook_task(
  body: &disco_client::entities::task::ProcessGithubWebhookBody,
) -> anyhow::Result<()> {
  match body.event.as_str() {
    "push" => process_push(&body.request_body).await,
    "installation" => {
      process_installation(body.app_id, &body.request_body).await
    }
    "installation_repositories" => {
      process_installation_repositories(
        body.app_id,
        &body.request_body,
      )
      .await
    }
    other => {
      info!("ignoring GitHub webhook event {other}");
      Ok(())
    }
  }
}

async fn process_push(request_body: &str) -> anyhow::Result<()> {
  let push = github::parse_push_payload(request_body)
    .context("unparseable push payload")?;
  if push.branch != "main" && push.branch != "master" {
    info!(
      "push to {} was not main or master, skipping",
      push.branch
    );
    return Ok(());
  }
  let pool = &db_client().pool;
  let Some(project) = database::projects::get_by_github_repo(
    pool,
    &push.full_name,
  )
  .await?
  else {
    info!("no project bound to {}, skipping push", push.full_name);
    return Ok(());
  };
  let commit_hash = if push.commit_hash.is_empty() {
    String::from(DEPLOY_LATEST)
  } else {
    push.commit_hash
  };
  engine::create_deployment(
    &project,
    Some(commit_hash),
    None,
    None,
  )
  .await?;
  Ok(())
}

async fn process_installation(
  app_id: i64,
  request_body: &str,
) -> anyhow::Result<()> {
  let payload = github::parse_installation_payload(request_body)
    .context("unparseable installation payload")?;
  let pool = &db_client().pool;
  match payload.action.as_str() {
    "created" => {
      github_apps::add_installation(
        pool,
        payload.installation_id,
        app_id,
      )
      .await?;
      for repo in payload.repositories {
        github_apps::add_repo(
          pool,
          payload.installation_id,
          &repo,
        )
        .await?;
      }
    }
    "deleted" => {
      github_apps::remove_installation(
        pool,
        payload.installation_id,
      )
      .await?;
      github_apps::delete_installation_record(
        pool,
        payload.installation_id,
      )
      .await?;
    }
    other => {
      info!("ignoring installation action {other}");
    }
  }
  Ok(())
}

async fn process_installation_repositories(
  _app_id: i64,
  request_body: &str,
) -> anyhow::Result<()> {
  let payload =
    github::parse_installation_repositories_payload(request_body)
      .context("unparseable installation_repositories payload")?;
  let pool = &db_client().pool;
  if github_apps::get_installation(pool, payload.installation_id)
    .await?
    .is_none()
  {
    warn!(
      "installation {} unknown, skipping repo reconciliation",
      payload.installation_id
    );
    return Ok(());
  }
  for repo in payload.added {
    github_apps::add_repo(pool, payload.installation_id, &repo)
      .await?;
  }
  for repo in payload.removed {
    github_apps::remove_repo(pool, payload.installation_id, &repo)
      .await?;
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).unwrap();
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
  }

  #[test]
  fn valid_signature_passes() {
    let secret = b"webhook-secret";
    let body = br#"{"zen":"Design for failure."}"#;
    let header = sign(secret, body);
    assert!(verify_signature(secret, body, &header).is_ok());
  }

  #[test]
  fn equal_length_forgery_is_rejected() {
    let secret = b"webhook-secret";
    let body = br#"{"zen":"Design for failure."}"#;
    let header = format!("sha256={}", "0".repeat(64));
    assert!(verify_signature(secret, body, &header).is_err());
  }

  #[test]
  fn tampered_body_is_rejected() {
    let secret = b"webhook-secret";
    let header = sign(secret, b"original");
    assert!(verify_signature(secret, b"tampered", &header).is_err());
  }

  #[test]
  fn malformed_headers_are_rejected() {
    assert!(verify_signature(b"s", b"b", "sha1=abcd").is_err());
    assert!(
      verify_signature(b"s", b"b", "sha256=nothex").is_err()
    );
  }
}
