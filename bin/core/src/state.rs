use std::sync::OnceLock;

use anyhow::{Context, anyhow};
use database::outputs::OutputStores;

use crate::{
  config::core_config, events::EventsHub, logs::LogsHub,
  runners::tunnel::TunnelsHub, schedule::Scheduler,
  syslog::SyslogsHub,
};

static DB_CLIENT: OnceLock<database::DbClient> = OnceLock::new();

pub fn db_client() -> &'static database::DbClient {
  DB_CLIENT.get().unwrap_or_else(|| {
    error!(
      "FATAL: db_client accessed before initialized | Ensure init_db_client() is called during startup | Exiting..."
    );
    std::process::exit(1)
  })
}

/// Must be called in process startup sequence.
pub async fn init_db_client() {
  let init = async {
    let client =
      database::DbClient::new(&core_config().database_path)
        .await
        .context("failed to initialize database client")?;
    DB_CLIENT.set(client).map_err(|_| {
      anyhow!("db_client initialized more than once")
    })?;
    anyhow::Ok(())
  }
  .await;
  if let Err(e) = init {
    error!(
      "FATAL: Failed to initialize database client | {e:#} | Exiting..."
    );
    std::process::exit(1)
  }
}

/// Point the process-wide client at an in-memory store for tests.
#[cfg(test)]
pub async fn init_test_db() {
  if DB_CLIENT.get().is_none() {
    let client = database::DbClient::new_in_memory()
      .await
      .expect("in-memory database");
    let _ = DB_CLIENT.set(client);
  }
}

pub fn output_stores() -> &'static OutputStores {
  static OUTPUT_STORES: OnceLock<OutputStores> = OnceLock::new();
  OUTPUT_STORES.get_or_init(|| {
    OutputStores::new(core_config().command_outputs_dir.clone())
  })
}

pub fn scheduler() -> &'static Scheduler {
  static SCHEDULER: OnceLock<Scheduler> = OnceLock::new();
  SCHEDULER.get_or_init(Default::default)
}

pub fn tunnels_hub() -> &'static TunnelsHub {
  static TUNNELS_HUB: OnceLock<TunnelsHub> = OnceLock::new();
  TUNNELS_HUB.get_or_init(Default::default)
}

pub fn syslogs_hub() -> &'static SyslogsHub {
  static SYSLOGS_HUB: OnceLock<SyslogsHub> = OnceLock::new();
  SYSLOGS_HUB.get_or_init(Default::default)
}

pub fn events_hub() -> &'static EventsHub {
  static EVENTS_HUB: OnceLock<EventsHub> = OnceLock::new();
  EVENTS_HUB.get_or_init(Default::default)
}

pub fn logs_hub() -> &'static LogsHub {
  static LOGS_HUB: OnceLock<LogsHub> = OnceLock::new();
  LOGS_HUB.get_or_init(Default::default)
}
