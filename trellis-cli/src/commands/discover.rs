//! Discover command
//!
//! Read-only: lists what the provider already holds for a cluster.

use anyhow::{Context, Result};
use colored::*;
use trellis_engine::hosting::HostingManager;
use trellis_engine::{CloudHostingManager, EngineConfig};

use crate::config::{Config, load_definition};

pub async fn discover(config: &Config, definition_path: &str, json: bool) -> Result<()> {
    let definition = load_definition(definition_path)?;
    let manager = CloudHostingManager::new(
        "gateway",
        config.cloud(),
        definition.name.clone(),
        &EngineConfig::from_env(),
    );

    let discovery = manager
        .discover(&definition)
        .await
        .with_context(|| format!("Failed to discover cluster {}", definition.name))?;

    if json {
        let resources: Vec<_> = discovery.table.iter().collect();
        let nodes: Vec<_> = discovery.nodes.iter().collect();
        let output = serde_json::json!({
            "cluster": definition.name,
            "resources": resources,
            "nodes": nodes,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if discovery.table.is_empty() {
        println!("{}", "No resources found.".yellow());
        return Ok(());
    }

    println!(
        "{} {} resource(s) for {}",
        "Found".bold(),
        discovery.table.len(),
        definition.name.cyan()
    );
    for resource in discovery.table.iter() {
        println!(
            "  {:<16} {:<32} {} {}",
            resource.kind.as_str(),
            resource.logical_name().unwrap_or("-"),
            resource.id.cyan(),
            resource.state.dimmed()
        );
    }

    println!("{}", "Nodes:".bold());
    for node in discovery.nodes.iter() {
        let declared = if definition.node(&node.name).is_some() {
            "".normal()
        } else {
            "(undeclared, will be pruned)".red()
        };
        println!(
            "  {:<12} {:<14} partition {:<3} ssh {:<6} {} {}",
            node.name.bold(),
            node.role.to_string(),
            node.partition.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            node.ssh_port.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            if node.bootstrap_cleared() { "ready".green() } else { "bootstrap pending".yellow() },
            declared
        );
    }
    Ok(())
}
