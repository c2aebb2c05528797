use std::path::Path;

use anyhow::Context;

use crate::{LogSink, run_git};

/// Clone `repo_url` into `dest`, replacing anything already there.
/// The URL may embed an access token; it is never echoed to the sink
/// (git itself keeps credentials out of its progress output).
pub async fn clone(
  repo_url: &str,
  dest: &Path,
  log: Option<&LogSink>,
) -> anyhow::Result<()> {
  if dest.exists() {
    tokio::fs::remove_dir_all(dest)
      .await
      .with_context(|| {
        format!("failed to clear clone target {dest:?}")
      })?;
  }
  debug!("cloning into {dest:?}");
  let dest = dest.to_string_lossy();
  run_git("clone", &["git", "clone", repo_url, &dest], log).await
}

/// Update the `origin` remote URL, used when installation tokens
/// rotate between deployments.
pub async fn set_remote_url(
  repo_dir: &Path,
  repo_url: &str,
) -> anyhow::Result<()> {
  let dir = repo_dir.to_string_lossy();
  run_git(
    "remote set-url",
    &["git", "-C", &dir, "remote", "set-url", "origin", repo_url],
    None,
  )
  .await
}
