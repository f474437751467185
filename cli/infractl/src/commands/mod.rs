//! CLI commands.

mod info;
mod infra;
mod scale;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::client::ApiClient;
use crate::output::OutputFormat;

/// infractl - Manage infrastructures supervised by infra-manager.
#[derive(Debug, Parser)]
#[command(name = "infractl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Base URL of the control API.
    #[arg(long, global = true, env = "INFRACTL_URL", default_value = "http://127.0.0.1:5000")]
    url: String,

    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List managed infrastructures.
    List,

    /// Show an infrastructure report.
    Get(infra::InfraArgs),

    /// Submit a description file and start maintaining it.
    Create(infra::CreateArgs),

    /// Detach (if managed) and tear down an infrastructure.
    Delete(infra::InfraArgs),

    /// Resume maintenance of a submitted infrastructure.
    Attach(infra::InfraArgs),

    /// Stop maintenance, leaving the infrastructure provisioned.
    Detach(infra::InfraArgs),

    /// Request more instances of a node.
    ScaleUp(scale::ScaleUpArgs),

    /// Request one instance of a node to be removed.
    ScaleDown(scale::ScaleDownArgs),

    /// Query the info broker.
    Info(info::InfoArgs),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            client: ApiClient::new(&self.url)?,
            format: OutputFormat::parse(&self.format),
        };

        match self.command {
            Commands::List => infra::list(ctx).await,
            Commands::Get(args) => infra::get(ctx, args).await,
            Commands::Create(args) => infra::create(ctx, args).await,
            Commands::Delete(args) => infra::delete(ctx, args).await,
            Commands::Attach(args) => infra::attach(ctx, args).await,
            Commands::Detach(args) => infra::detach(ctx, args).await,
            Commands::ScaleUp(args) => scale::scale_up(ctx, args).await,
            Commands::ScaleDown(args) => scale::scale_down(ctx, args).await,
            Commands::Info(args) => info::query(ctx, args).await,
            Commands::Version => {
                println!("infractl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub client: ApiClient,
    pub format: OutputFormat,
}
