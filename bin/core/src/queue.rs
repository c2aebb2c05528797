//! Task queue consumer: the worker's main loop.
//!
//! Polls every 500 ms, claims the oldest QUEUED task, dispatches by
//! name. Any handler error marks the task FAILED with
//! `{reason: "EXCEPTION"}` and the loop keeps draining; operators
//! retry by redeploying, not through the queue.

use std::time::Duration;

use anyhow::Context;
use database::tasks;
use disco_client::entities::task::{
  ProcessDeploymentBody, ProcessGithubWebhookBody, Task, TaskName,
};
use serde_json::json;

use crate::{engine, listener, state::db_client};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub async fn run_consumer() {
  info!("starting task queue consumer");
  loop {
    let claimed = tasks::claim_next(&db_client().pool).await;
    match claimed {
      Ok(Some(task)) => process_task(task).await,
      Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
      Err(e) => {
        error!("failed to claim next task | {e:#}");
        tokio::time::sleep(POLL_INTERVAL).await;
      }
    }
  }
}

async fn process_task(task: Task) {
  let pool = &db_client().pool;
  match handle(&task).await {
    Ok(result) => {
      if let Err(e) = tasks::complete(pool, &task.id, &result).await
      {
        error!("failed to mark task {} completed | {e:#}", task.id);
      }
    }
    Err(e) => {
      error!(
        "exception processing task {} {} | {e:#}",
        task.id, task.name
      );
      let result = json!({ "reason": "EXCEPTION" });
      if let Err(e) = tasks::fail(pool, &task.id, &result).await {
        error!("failed to mark task {} failed | {e:#}", task.id);
      }
    }
  }
}

async fn handle(task: &Task) -> anyhow::Result<serde_json::Value> {
  match task.name {
    TaskName::ProcessDeployment => {
      let body: ProcessDeploymentBody =
        serde_json::from_str(&task.body)
          .context("invalid PROCESS_DEPLOYMENT body")?;
      engine::flow::process_deployment(&body.deployment_id).await
    }
    TaskName::ProcessGithubWebhook => {
      let body: ProcessGithubWebhookBody =
        serde_json::from_str(&task.body)
          .context("invalid PROCESS_GITHUB_WEBHOOK body")?;
      listener::process_webhook_task(&body).await?;
      Ok(json!({}))
    }
  }
}
