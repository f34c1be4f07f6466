mod cli;
mod engine;
mod metrics;
mod model;
mod stats;
mod storage;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::run(args).await
}
