#![forbid(unsafe_code)]
#![deny(
    warnings,
    dead_code,
    unused,
    unused_imports,
    unused_must_use,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::cargo,
    clippy::nursery,
    rustdoc::broken_intra_doc_links,
    rustdoc::bare_urls,
    missing_docs
)]
#![allow(clippy::multiple_crate_versions)]

//! Binary entrypoint that wires the Trawler services together and launches
//! the scheduler.

mod bootstrap;
mod cli;
mod telemetry;

use anyhow::Result;
use clap::Parser;

/// Parses the command line and dispatches; a non-zero exit signals a
/// configuration or initialisation failure.
#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_logging()?;
    let cli = cli::Cli::parse();
    bootstrap::run(cli).await
}
