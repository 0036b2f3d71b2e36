//! `burrow`: command-line harness for a burrow store
//!
//! Values are stored as JSON documents, so any store written by this tool
//! can be read back by it regardless of what was set.

mod commands;
mod config;
mod logging;

use clap::Parser;
use tracing::debug;

use crate::config::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&cli.log_level, cli.log_format);

    let config = commands::resolve_config(&cli).await?;
    debug!(path = %config.path.display(), command = ?cli.command, "Running");

    let output = commands::execute(config, cli.command).await?;
    print!("{}", output);
    Ok(())
}
