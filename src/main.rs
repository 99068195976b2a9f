//! boxctld - boxctl host daemon
//!
//! Runs on the developer workstation and provides desktop notifications,
//! clipboard integration, port tunneling, session streaming, and completion
//! data to every boxctl container over an SSH control channel.

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod cmd;

#[derive(Parser)]
#[command(name = "boxctld")]
#[command(about = "boxctl host daemon")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to the host configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("boxctld={}", log_level).into()),
        )
        .init();

    info!("Starting boxctld v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run().await?;
        }
        None => {
            cmd::root::run(cli.config.as_deref()).await?;
        }
    }

    Ok(())
}
