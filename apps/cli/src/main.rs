//! deltacrawl CLI: incremental catalog change detection.
//!
//! Re-crawls configured source groups, classifies what is new, moved, or
//! gone since the last run, and enriches only the new entries.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
