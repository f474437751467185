//! infractl - CLI for the infravisor control API
//!
//! Submits infrastructure descriptions and drives their maintenance
//! lifecycle: attach, detach, scale and tear down.

use anyhow::Result;
use clap::Parser;

mod client;
mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
