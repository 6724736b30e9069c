//! Trellis CLI
//!
//! Provisions a cluster from its JSON definition through a provider gateway,
//! or shows what already exists for it.

mod commands;
mod config;

use anyhow::Result;
use clap::Parser;
use commands::{Commands, handle_command};
use config::Config;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "trellis")]
#[command(about = "Cluster infrastructure provisioner", long_about = None)]
struct Cli {
    /// Provider gateway URL
    #[arg(
        long,
        env = "TRELLIS_PROVIDER_URL",
        default_value = "http://localhost:8787"
    )]
    provider_url: String,

    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis_engine=info,trellis_provider=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = Config {
        provider_url: cli.provider_url,
    };

    handle_command(cli.command, &config).await
}
