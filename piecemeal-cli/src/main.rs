//! Piecemeal CLI - drive the scheduler against a simulated swarm
//!
//! Useful for watching read-ahead decisions without a real torrent engine.

mod commands;

use std::path::PathBuf;

use clap::Parser;
use piecemeal_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "piecemeal")]
#[command(about = "Piece scheduling for streaming files out of torrents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: commands::Commands,

    /// Console log level (RUST_LOG overrides)
    #[arg(long, value_enum, default_value = "info")]
    log_level: CliLogLevel,

    /// Directory for the full trace of this run
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), cli.logs_dir.as_deref())?;

    commands::handle_command(cli.command).await
}
