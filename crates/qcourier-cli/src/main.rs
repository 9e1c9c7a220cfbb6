use anyhow::Result;
use clap::{Parser, Subcommand};
use qcourier_storage::DedupStore;
use qcourier_sync::{spawn_shutdown_listener, CourierConfig, CourierPipeline};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "qcourier")]
#[command(about = "Submits pending circuit payloads to the remote compute service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One discovery pass, then exit.
    Run,
    /// Poll for new work until interrupted.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = CourierConfig::from_env()?;
    let pipeline = CourierPipeline::new(config.clone())?;
    let mut store = DedupStore::load(config.dedup_snapshot_path()).await?;
    info!(known_keys = store.len(), "dedup snapshot loaded");

    match cli.command.unwrap_or(Commands::Watch) {
        Commands::Run => {
            let summary = pipeline.run_pass(&mut store).await?;
            println!(
                "pass complete: processed={} successful={} failed={}",
                summary.total_processed, summary.successful, summary.failed
            );
        }
        Commands::Watch => {
            let shutdown = spawn_shutdown_listener();
            pipeline.run_poll_loop(&mut store, shutdown).await?;
            println!("stopped, dedup snapshot flushed");
        }
    }

    Ok(())
}
