use std::path::Path;

use crate::{LogSink, run_git};

pub async fn fetch(
  repo_dir: &Path,
  log: Option<&LogSink>,
) -> anyhow::Result<()> {
  let dir = repo_dir.to_string_lossy();
  run_git(
    "fetch",
    &["git", "-C", &dir, "fetch", "--prune", "origin"],
    log,
  )
  .await
}

/// Hard-reset the working tree to an exact commit.
pub async fn checkout_commit(
  repo_dir: &Path,
  commit: &str,
  log: Option<&LogSink>,
) -> anyhow::Result<()> {
  let dir = repo_dir.to_string_lossy();
  run_git(
    "checkout",
    &["git", "-C", &dir, "reset", "--hard", commit],
    log,
  )
  .await
}

/// Hard-reset the working tree to the tip of `origin/<branch>`.
pub async fn checkout_branch_latest(
  repo_dir: &Path,
  branch: &str,
  log: Option<&LogSink>,
) -> anyhow::Result<()> {
  let dir = repo_dir.to_string_lossy();
  let target = format!("origin/{branch}");
  run_git(
    "checkout",
    &["git", "-C", &dir, "reset", "--hard", &target],
    log,
  )
  .await
}

/// Whether `origin/<branch>` exists after a fetch.
pub async fn remote_branch_exists(
  repo_dir: &Path,
  branch: &str,
) -> bool {
  let dir = repo_dir.to_string_lossy();
  let target = format!("refs/remotes/origin/{branch}");
  match command::call(&[
    "git",
    "-C",
    &dir,
    "show-ref",
    "--verify",
    "--quiet",
    &target,
  ])
  .await
  {
    Ok(output) => output.success(),
    Err(e) => {
      warn!("failed to check branch {branch} | {e:#}");
      false
    }
  }
}
