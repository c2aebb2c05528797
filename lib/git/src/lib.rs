//! Git operations over working trees under `/disco/projects/<name>`.
//!
//! Everything shells out to the `git` binary through the [command]
//! crate. Output lines can be streamed to a caller-supplied sink so
//! deployments can surface clone/fetch progress in their log stream.

#[macro_use]
extern crate tracing;

mod checkout;
mod clone;

pub use checkout::*;
pub use clone::*;

use anyhow::Context;
use tokio::sync::mpsc::UnboundedSender;

/// Failure of a git subcommand, with the command's own words attached.
#[derive(Debug, thiserror::Error)]
#[error("git {operation} failed: {detail}")]
pub struct GitError {
  pub operation: String,
  pub detail: String,
}

impl GitError {
  pub(crate) fn new(
    operation: &str,
    output: &command::CommandOutput,
  ) -> GitError {
    GitError {
      operation: operation.to_string(),
      detail: output.combined().trim().to_string(),
    }
  }
}

pub type LogSink = UnboundedSender<String>;

/// Hash of the working tree's HEAD commit.
pub async fn head_commit_hash(
  repo_dir: &std::path::Path,
) -> anyhow::Result<String> {
  let dir = repo_dir.to_string_lossy();
  let output = command::call(&[
    "git", "-C", &dir, "rev-parse", "HEAD",
  ])
  .await
  .context("failed to run git rev-parse")?;
  if !output.success() {
    return Err(GitError::new("rev-parse", &output).into());
  }
  Ok(output.stdout.trim().to_string())
}

pub(crate) async fn run_git(
  operation: &str,
  args: &[&str],
  log: Option<&LogSink>,
) -> anyhow::Result<()> {
  match log {
    Some(sink) => {
      let (tx, mut rx) =
        tokio::sync::mpsc::unbounded_channel::<String>();
      let forward = {
        let sink = sink.clone();
        tokio::spawn(async move {
          let mut lines = Vec::new();
          while let Some(line) = rx.recv().await {
            let _ = sink.send(format!("{line}\n"));
            lines.push(line);
          }
          lines
        })
      };
      let code =
        command::call_streaming(args, tx, None).await?;
      let lines = forward.await.unwrap_or_default();
      if code != Some(0) {
        return Err(
          GitError {
            operation: operation.to_string(),
            detail: lines.join("\n"),
          }
          .into(),
        );
      }
      Ok(())
    }
    None => {
      let output = command::call(args)
        .await
        .with_context(|| format!("failed to run git {operation}"))?;
      if !output.success() {
        return Err(GitError::new(operation, &output).into());
      }
      Ok(())
    }
  }
}

#[cfg(test)]
mod tests {
  use std::path::Path;

  use super::*;

  async fn init_repo(dir: &Path) {
    for args in [
      vec!["git", "init", "-b", "main"],
      vec!["git", "config", "user.email", "test@example.com"],
      vec!["git", "config", "user.name", "test"],
      vec![
        "git",
        "commit",
        "--allow-empty",
        "-m",
        "first commit",
      ],
    ] {
      let mut full = vec!["git", "-C", dir.to_str().unwrap()];
      full.extend(&args[1..]);
      command::check_call(&full).await.unwrap();
    }
  }

  #[tokio::test]
  async fn head_commit_hash_resolves() {
    let dir = tempfile::tempdir().unwrap();
    init_repo(dir.path()).await;
    let hash = head_commit_hash(dir.path()).await.unwrap();
    assert_eq!(hash.len(), 40);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }

  #[tokio::test]
  async fn rev_parse_outside_a_repo_is_a_git_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = head_commit_hash(dir.path()).await.unwrap_err();
    assert!(err.downcast_ref::<GitError>().is_some());
  }
}
