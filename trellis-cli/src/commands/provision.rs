//! Provision command

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::*;
use tracing::debug;
use trellis_engine::{
    CloudHostingManager, ConsoleSink, EngineConfig, Pipeline, ProgressSink, RunSummary, TracingSink,
};

use crate::config::{Config, load_definition};

pub struct ProvisionOptions {
    pub max_parallel: Option<usize>,
    pub single_host: bool,
    pub ssh: Option<bool>,
    pub quiet: bool,
    pub json: bool,
}

pub async fn provision(config: &Config, definition_path: &str, options: ProvisionOptions) -> Result<()> {
    let mut definition = load_definition(definition_path)?;
    if options.ssh.is_some() {
        definition.ssh_access = options.ssh;
    }

    let mut engine = EngineConfig::from_env();
    if let Some(max_parallel) = options.max_parallel {
        engine = engine.with_max_parallel(max_parallel);
    }
    engine.validate().context("Invalid engine configuration")?;
    debug!("Engine configuration: {:?}", engine);

    let mut manager = CloudHostingManager::new("gateway", config.cloud(), definition.name.clone(), &engine);
    if options.single_host {
        manager = manager.with_default_parallelism(1);
    }

    let sink: Arc<dyn ProgressSink> = if options.quiet {
        Arc::new(TracingSink)
    } else {
        Arc::new(ConsoleSink)
    };

    println!(
        "{} {} ({} node(s)) via {}",
        "Provisioning".bold(),
        definition.name.cyan(),
        definition.nodes.len(),
        config.provider_url.dimmed()
    );

    let mut pipeline = Pipeline::new(Arc::new(manager), definition, engine, sink);
    match pipeline.run().await {
        Ok(summary) => {
            if options.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                print_summary(&summary);
            }
            Ok(())
        }
        Err(e) => {
            println!("{} {}", "✗ Provisioning failed:".red().bold(), e);
            println!("  Rerun the same command once the cause is fixed; finished work is kept.");
            Err(e).context("Provisioning failed")
        }
    }
}

fn print_summary(summary: &RunSummary) {
    println!("{}", "✓ Cluster is up to date".green().bold());
    println!("  Cluster:    {}", summary.cluster.cyan());
    println!(
        "  Resources:  {} ({} found, {} created)",
        summary.resources,
        summary.discovered,
        summary.created.to_string().green()
    );
    if summary.pruned > 0 {
        println!("  Pruned:     {} node(s)", summary.pruned.to_string().yellow());
    }
    println!(
        "  SSH access: {}",
        if summary.ssh_enabled { "on".yellow() } else { "off".dimmed() }
    );
    println!(
        "  Routing:    {} target group(s), {} listener(s)",
        summary.routing.target_groups, summary.routing.listeners
    );

    println!("  Nodes:");
    for node in &summary.nodes {
        println!(
            "    - {} {} partition {} ssh {} {}",
            node.name.bold(),
            node.role.to_string().dimmed(),
            node.partition.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            node.ssh_port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            node.phase.to_string().green()
        );
    }
}
