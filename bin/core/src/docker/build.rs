use std::path::Path;

use anyhow::Context;
use tokio::sync::mpsc::UnboundedSender;

use super::ContainerError;

/// Build an image from a project working tree, streaming build
/// output lines into `log`.
pub async fn build_image(
  image: &str,
  project_dir: &Path,
  dockerfile: &str,
  context: &str,
  log: &UnboundedSender<String>,
) -> anyhow::Result<()> {
  let dockerfile = project_dir.join(dockerfile);
  let context = project_dir.join(context);
  let dockerfile = dockerfile.to_string_lossy();
  let context = context.to_string_lossy();
  let args = [
    "docker",
    "build",
    "--tag",
    image,
    "--file",
    &dockerfile,
    context.as_ref(),
  ];
  stream_docker("build", &args, log).await
}

pub async fn push_image(
  image: &str,
  log: &UnboundedSender<String>,
) -> anyhow::Result<()> {
  stream_docker("push", &["docker", "push", image], log).await
}

async fn stream_docker(
  operation: &str,
  args: &[&str],
  log: &UnboundedSender<String>,
) -> anyhow::Result<()> {
  let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
  let forward = {
    let log = log.clone();
    tokio::spawn(async move {
      let mut tail: Vec<String> = Vec::new();
      while let Some(line) = rx.recv().await {
        let _ = log.send(format!("{line}\n"));
        tail.push(line);
        if tail.len() > 20 {
          tail.remove(0);
        }
      }
      tail
    })
  };
  let exit_code = command::call_streaming(args, tx, None)
    .await
    .with_context(|| format!("failed to run docker {operation}"))?;
  let tail = forward.await.unwrap_or_default();
  if exit_code == Some(0) {
    Ok(())
  } else {
    Err(
      ContainerError {
        operation: operation.to_string(),
        stderr: tail.join("\n"),
        exit_code,
      }
      .into(),
    )
  }
}

/// Reclaim build cache; runs on the scheduler's day tick.
pub async fn builder_prune() -> anyhow::Result<()> {
  super::docker("builder prune", &["builder", "prune", "-a", "-f"])
    .await?;
  Ok(())
}
