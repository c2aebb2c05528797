use crate::{
  config::core_config,
  runners::{run, shell},
};

/// Runs after the database connects, before the scheduler or
/// consumer start. Anything ephemeral that predates this process is
/// an orphan by definition and gets reclaimed.
pub async fn on_startup() {
  for dir in [
    &core_config().projects_dir,
    &core_config().srv_dir,
    &core_config().command_outputs_dir,
  ] {
    if let Err(e) = tokio::fs::create_dir_all(dir).await {
      error!("failed to create {dir:?} | {e}");
    }
  }
  run::clean_up_orphan_runs(true).await;
  shell::clean_up_orphan_shells(true).await;
}
