//! CLI configuration

use std::sync::Arc;

use anyhow::{Context, Result};
use trellis_core::domain::ClusterDefinition;
use trellis_provider::{CloudApi, HttpCloud};

#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the provider gateway
    pub provider_url: String,
}

impl Config {
    pub fn cloud(&self) -> Arc<dyn CloudApi> {
        Arc::new(HttpCloud::new(self.provider_url.clone()))
    }
}

/// Reads and validates a cluster definition file
pub fn load_definition(path: &str) -> Result<ClusterDefinition> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read cluster definition: {}", path))?;
    ClusterDefinition::from_json(&json)
        .with_context(|| format!("Invalid cluster definition: {}", path))
}
