use std::path::Path;

use anyhow::Context;

use crate::config::core_config;

/// Copy the built `public_path` out of the checkout into the
/// versioned docroot caddy serves, `<srv>/<project>/<number>/`.
pub async fn prepare(
  project_name: &str,
  public_path: &str,
  deployment_number: i64,
) -> anyhow::Result<()> {
  let source =
    core_config().project_dir(project_name).join(public_path);
  if !source.is_dir() {
    return Err(anyhow::anyhow!(
      "public path {public_path} not found in project checkout"
    ));
  }
  let target = core_config()
    .static_site_dir(project_name, deployment_number);
  tokio::fs::create_dir_all(&target).await.with_context(|| {
    format!("failed to create docroot {target:?}")
  })?;
  copy_dir(&source, &target).await
}

async fn copy_dir(
  source: &Path,
  target: &Path,
) -> anyhow::Result<()> {
  let mut stack = vec![(source.to_path_buf(), target.to_path_buf())];
  while let Some((source, target)) = stack.pop() {
    tokio::fs::create_dir_all(&target).await?;
    let mut entries = tokio::fs::read_dir(&source)
      .await
      .with_context(|| format!("failed to read {source:?}"))?;
    while let Some(entry) = entries.next_entry().await? {
      let file_type = entry.file_type().await?;
      let dest = target.join(entry.file_name());
      if file_type.is_dir() {
        stack.push((entry.path(), dest));
      } else if file_type.is_file() {
        tokio::fs::copy(entry.path(), &dest)
          .await
          .with_context(|| {
            format!("failed to copy {:?}", entry.path())
          })?;
      }
      // symlinks are skipped; docroots are served as-is and a
      // link out of the checkout must not escape into the host
    }
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn copies_nested_trees() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("dist");
    std::fs::create_dir_all(source.join("assets")).unwrap();
    std::fs::write(source.join("index.html"), "<html>").unwrap();
    std::fs::write(source.join("assets/app.js"), "js").unwrap();
    let target = dir.path().join("srv/blog/1");
    copy_dir(&source, &target).await.unwrap();
    assert_eq!(
      std::fs::read_to_string(target.join("index.html")).unwrap(),
      "<html>"
    );
    assert_eq!(
      std::fs::read_to_string(target.join("assets/app.js"))
        .unwrap(),
      "js"
    );
  }
}
