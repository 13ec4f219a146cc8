//! refkb CLI: build remote knowledge bases from report references.
//!
//! Selects references from the local database, enriches them, and publishes
//! them as documents to a Dify-compatible knowledge-base service.

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
