//! Async subprocess driver used for every external binary Disco
//! shells out to (docker, git).
//!
//! All variants capture output without blocking the executor thread.
//! Spawn failures and non-zero exits surface through the returned
//! [CommandOutput] / `Result`, never through panics.

#[macro_use]
extern crate tracing;

use std::{process::Stdio, time::Duration};

use anyhow::{Context, anyhow};
use futures_util::StreamExt;
use tokio::{
  io::AsyncWriteExt,
  process::{Child, Command},
  sync::mpsc,
};
use tokio_util::codec::{FramedRead, LinesCodec};

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
  pub stdout: String,
  pub stderr: String,
  pub exit_code: Option<i32>,
}

impl CommandOutput {
  pub fn success(&self) -> bool {
    self.exit_code == Some(0)
  }

  /// Combined output with stderr last, for error context.
  pub fn combined(&self) -> String {
    let mut combined = self.stdout.clone();
    if !self.stderr.is_empty() {
      if !combined.is_empty() && !combined.ends_with('\n') {
        combined.push('\n');
      }
      combined.push_str(&self.stderr);
    }
    combined
  }
}

/// Raised when a command exceeds its allotted time. The child is
/// killed before this is returned.
#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("command timed out after {0:?}")]
pub struct CommandTimeout(pub Duration);

/// Run an argv, capturing stdout and stderr. Errors only when the
/// binary cannot be spawned; inspect [CommandOutput::success] for the
/// exit status.
pub async fn call(
  args: &[&str],
) -> anyhow::Result<CommandOutput> {
  call_with_stdin(args, None).await
}

pub async fn call_with_stdin(
  args: &[&str],
  stdin: Option<&[u8]>,
) -> anyhow::Result<CommandOutput> {
  let (program, rest) =
    args.split_first().context("empty command")?;
  let mut child = Command::new(program)
    .args(rest)
    .stdin(if stdin.is_some() {
      Stdio::piped()
    } else {
      Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .with_context(|| format!("failed to spawn {program}"))?;
  if let Some(bytes) = stdin {
    let mut handle =
      child.stdin.take().context("child stdin not piped")?;
    handle
      .write_all(bytes)
      .await
      .context("failed writing to child stdin")?;
    drop(handle);
  }
  let output = child
    .wait_with_output()
    .await
    .with_context(|| format!("failed waiting for {program}"))?;
  Ok(CommandOutput {
    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    exit_code: output.status.code(),
  })
}

/// [call], but non-zero exits become errors carrying the output.
pub async fn check_call(
  args: &[&str],
) -> anyhow::Result<CommandOutput> {
  let output = call(args).await?;
  if output.success() {
    Ok(output)
  } else {
    Err(output_error(args, &output))
  }
}

/// Run an argv streaming every output line (stdout and stderr
/// interleaved) into `on_line` as it is produced. Returns the exit
/// code. With `timeout` set, the child is killed and
/// [CommandTimeout] returned when the limit passes.
pub async fn call_streaming(
  args: &[&str],
  on_line: mpsc::UnboundedSender<String>,
  timeout: Option<Duration>,
) -> anyhow::Result<Option<i32>> {
  call_streaming_with_stdin(args, None, on_line, timeout).await
}

pub async fn call_streaming_with_stdin(
  args: &[&str],
  stdin: Option<Vec<u8>>,
  on_line: mpsc::UnboundedSender<String>,
  timeout: Option<Duration>,
) -> anyhow::Result<Option<i32>> {
  let (program, rest) =
    args.split_first().context("empty command")?;
  let mut child = Command::new(program)
    .args(rest)
    .stdin(if stdin.is_some() {
      Stdio::piped()
    } else {
      Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true)
    .spawn()
    .with_context(|| format!("failed to spawn {program}"))?;

  if let Some(bytes) = stdin {
    let mut handle =
      child.stdin.take().context("child stdin not piped")?;
    tokio::spawn(async move {
      let _ = handle.write_all(&bytes).await;
    });
  }

  let stdout = child.stdout.take().context("child stdout")?;
  let stderr = child.stderr.take().context("child stderr")?;
  let out_task = forward_lines(stdout, on_line.clone());
  let err_task = forward_lines(stderr, on_line);

  let wait = async {
    let status = child.wait().await?;
    // Drain the readers so trailing output is not lost.
    let _ = tokio::join!(out_task, err_task);
    anyhow::Ok(status.code())
  };

  match timeout {
    Some(limit) => match tokio::time::timeout(limit, wait).await {
      Ok(res) => res,
      Err(_) => {
        let _ = child.kill().await;
        Err(CommandTimeout(limit).into())
      }
    },
    None => wait.await,
  }
}

fn forward_lines(
  reader: impl tokio::io::AsyncRead + Unpin + Send + 'static,
  sender: mpsc::UnboundedSender<String>,
) -> tokio::task::JoinHandle<()> {
  tokio::spawn(async move {
    let mut lines =
      FramedRead::new(reader, LinesCodec::new_with_max_length(65536));
    while let Some(line) = lines.next().await {
      match line {
        Ok(line) => {
          if sender.send(line).is_err() {
            return;
          }
        }
        Err(e) => {
          trace!("dropping undecodable output line | {e}");
        }
      }
    }
  })
}

fn output_error(
  args: &[&str],
  output: &CommandOutput,
) -> anyhow::Error {
  let mut e = anyhow!(
    "process exited with status {}",
    output
      .exit_code
      .map(|c| c.to_string())
      .unwrap_or_else(|| String::from("unknown"))
  );
  for line in output
    .combined()
    .lines()
    .filter(|line| !line.is_empty())
    .rev()
  {
    e = e.context(line.to_string());
  }
  e.context(format!("command failed: {}", args.join(" ")))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn captures_stdout_and_exit_code() {
    let output = call(&["echo", "hello"]).await.unwrap();
    assert!(output.success());
    assert_eq!(output.stdout.trim(), "hello");
  }

  #[tokio::test]
  async fn nonzero_exit_is_not_a_call_error() {
    let output = call(&["sh", "-c", "exit 3"]).await.unwrap();
    assert!(!output.success());
    assert_eq!(output.exit_code, Some(3));
  }

  #[tokio::test]
  async fn check_call_surfaces_stderr() {
    let err =
      check_call(&["sh", "-c", "echo boom >&2; exit 1"])
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("boom"));
  }

  #[tokio::test]
  async fn stdin_is_piped() {
    let output =
      call_with_stdin(&["cat"], Some(b"over the wire"))
        .await
        .unwrap();
    assert_eq!(output.stdout, "over the wire");
  }

  #[tokio::test]
  async fn streaming_delivers_lines_in_order() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let code = call_streaming(
      &["sh", "-c", "echo one; echo two"],
      tx,
      None,
    )
    .await
    .unwrap();
    assert_eq!(code, Some(0));
    assert_eq!(rx.recv().await.unwrap(), "one");
    assert_eq!(rx.recv().await.unwrap(), "two");
  }

  #[tokio::test]
  async fn streaming_timeout_kills_the_child() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = call_streaming(
      &["sleep", "5"],
      tx,
      Some(Duration::from_millis(50)),
    )
    .await
    .unwrap_err();
    assert!(err.downcast_ref::<CommandTimeout>().is_some());
  }
}
