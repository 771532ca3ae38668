#![forbid(unsafe_code)]

use analytics_worker::{logging, shutdown_token, ConfigLoader, QueueWorker, Relay};
use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "analytics-relay")]
#[command(about = "Forward every event from an input exchange to each configured output")]
#[command(version)]
struct Cli {
    /// Program name; the worker consumes queue `analytics-<program>`
    #[arg(short, long, default_value = "relay")]
    program: String,

    /// Configuration file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Exchange to consume events from
    #[arg(short, long)]
    input: String,

    /// Output as `name:exchange`, may be repeated
    #[arg(short, long = "output")]
    outputs: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new(&cli.program);
    if let Some(path) = cli.config {
        loader = loader.with_file(path);
    }
    let config = loader.load()?;
    logging::init(&config.logging)?;

    info!(program = %config.program, "Initialising analytics relay");
    let worker = QueueWorker::new(config, cli.input, &cli.outputs)?;

    if let Err(e) = worker.run(shutdown_token(), Relay).await {
        error!("Relay stopped: {}", e);
        return Err(e.into());
    }

    let stats = worker.stats().snapshot();
    info!(
        received = stats.received,
        sent = stats.sent,
        "Shutdown complete, goodbye!"
    );
    Ok(())
}
