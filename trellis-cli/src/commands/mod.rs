//! Commands module

mod discover;
mod provision;

use anyhow::Result;
use clap::Subcommand;

use crate::config::Config;

/// Top-level CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create or repair a cluster so it matches its definition
    Provision {
        /// Path to the cluster definition (JSON)
        #[arg(short, long, env = "TRELLIS_DEFINITION")]
        definition: String,

        /// Maximum number of nodes provisioned at once
        #[arg(long, env = "TRELLIS_MAX_PARALLEL")]
        max_parallel: Option<usize>,

        /// Provision one node at a time unless --max-parallel says otherwise
        #[arg(long)]
        single_host: bool,

        /// Turn per-node SSH access on or off; omitted keeps the current setting
        #[arg(long)]
        ssh: Option<SshToggle>,

        /// Log progress instead of printing it
        #[arg(short, long)]
        quiet: bool,

        /// Print the run summary as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the resources and nodes that already exist for a cluster
    Discover {
        /// Path to the cluster definition (JSON)
        #[arg(short, long, env = "TRELLIS_DEFINITION")]
        definition: String,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum SshToggle {
    On,
    Off,
}

/// Handle a CLI command
pub async fn handle_command(command: Commands, config: &Config) -> Result<()> {
    match command {
        Commands::Provision {
            definition,
            max_parallel,
            single_host,
            ssh,
            quiet,
            json,
        } => {
            let options = provision::ProvisionOptions {
                max_parallel,
                single_host,
                ssh: ssh.map(|toggle| toggle == SshToggle::On),
                quiet,
                json,
            };
            provision::provision(config, &definition, options).await
        }
        Commands::Discover { definition, json } => discover::discover(config, &definition, json).await,
    }
}
