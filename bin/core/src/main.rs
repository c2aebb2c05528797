use anyhow::Context;
use clap::{Parser, Subcommand};
use disco_core::{config::core_config, queue, startup, state};
use tracing::info;

#[derive(Parser)]
#[command(name = "disco", about = "Disco deployment daemon")]
struct Cli {
  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Long-lived process serving operations, hubs and maintenance.
  Daemon,
  /// Task queue consumer driving deployments and project crons.
  Worker,
}

async fn daemon() -> anyhow::Result<()> {
  info!("Disco daemon version: v{}", env!("CARGO_PKG_VERSION"));
  state::init_db_client().await;
  startup::on_startup().await;
  tokio::spawn(state::scheduler().run(false));
  // pump log datagrams for the life of the process
  state::logs_hub().run().await;
  Ok(())
}

async fn worker() -> anyhow::Result<()> {
  info!("Disco worker version: v{}", env!("CARGO_PKG_VERSION"));
  state::init_db_client().await;
  startup::on_startup().await;
  tokio::spawn(state::scheduler().run(true));
  queue::run_consumer().await;
  Ok(())
}

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let cli = Cli::parse();
  logger::init(&core_config().logging)?;
  match cli.command {
    Commands::Daemon => daemon().await,
    Commands::Worker => worker().await,
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )
  .context("failed to install signal handler")?;
  tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => {
      info!("received SIGTERM, shutting down");
      Ok(())
    },
  }
}
