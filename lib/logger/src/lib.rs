use anyhow::Context;
use disco_client::entities::logger::{LogConfig, StdioLogMode};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

pub fn init(config: &LogConfig) -> anyhow::Result<()> {
  let log_level: tracing::Level = config.level.into();

  let registry =
    Registry::default().with(LevelFilter::from(log_level));

  match (config.stdio, config.pretty) {
    (StdioLogMode::Standard, true) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .pretty()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),
    (StdioLogMode::Standard, false) => registry
      .with(
        tracing_subscriber::fmt::layer()
          .with_file(false)
          .with_line_number(false),
      )
      .try_init(),
    (StdioLogMode::Json, _) => registry
      .with(tracing_subscriber::fmt::layer().json())
      .try_init(),
    (StdioLogMode::None, _) => Ok(()),
  }
  .context("failed to init logger")
}
