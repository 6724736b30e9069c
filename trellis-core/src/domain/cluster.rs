//! Cluster definition types
//!
//! The cluster definition is the declared input of a provisioning run. It is
//! read once, validated, and never mutated while a run is in progress.

use std::collections::{BTreeSet, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::ingress::{IngressRule, Protocol};
use crate::error::{ProvisionError, Result};

/// Declared state of a whole cluster
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterDefinition {
    /// Cluster name, used as the value of the `cluster` tag
    pub name: String,

    /// Nodes in declaration order
    pub nodes: Vec<NodeDefinition>,

    #[serde(default)]
    pub ingress_rules: Vec<IngressRule>,

    /// Externally reserved range for per-node SSH ports
    pub ssh_port_range: PortRange,

    /// Requested SSH access; `None` keeps whatever the network tag records
    #[serde(default)]
    pub ssh_access: Option<bool>,

    #[serde(default = "default_partitions")]
    pub control_plane_partitions: u32,

    #[serde(default = "default_partitions")]
    pub worker_partitions: u32,

    #[serde(default)]
    pub network: NetworkSettings,

    /// Standard account name the default image account is renamed to
    #[serde(default = "default_admin_account")]
    pub admin_account: String,

    /// Account the machine image ships with
    #[serde(default = "default_image_account")]
    pub image_account: String,

    /// Machine image used for every node
    #[serde(default = "default_machine_image")]
    pub machine_image: String,
}

fn default_partitions() -> u32 {
    1
}

fn default_admin_account() -> String {
    "trellis".to_string()
}

fn default_image_account() -> String {
    "admin".to_string()
}

fn default_machine_image() -> String {
    "default".to_string()
}

impl ClusterDefinition {
    /// Parses a definition from JSON and validates it
    pub fn from_json(json: &str) -> Result<Self> {
        let definition: ClusterDefinition = serde_json::from_str(json)
            .map_err(|e| ProvisionError::Validation(format!("malformed definition: {e}")))?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn node(&self, name: &str) -> Option<&NodeDefinition> {
        self.nodes.iter().find(|node| node.name == name)
    }

    pub fn nodes_with_role(&self, role: NodeRole) -> impl Iterator<Item = &NodeDefinition> {
        self.nodes.iter().filter(move |node| node.role == role)
    }

    /// Configured partition count for a role
    pub fn partitions_for(&self, role: NodeRole) -> u32 {
        match role {
            NodeRole::ControlPlane => self.control_plane_partitions,
            NodeRole::Worker => self.worker_partitions,
        }
    }

    /// Checks every invariant of the definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ProvisionError::Validation("cluster name cannot be empty".into()));
        }

        if !self
            .name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return Err(ProvisionError::Validation(format!(
                "cluster name '{}' may only contain ASCII letters, digits and '-'",
                self.name
            )));
        }

        if self.nodes.is_empty() {
            return Err(ProvisionError::Validation("cluster has no nodes".into()));
        }

        let mut names = HashSet::new();
        for node in &self.nodes {
            if node.name.is_empty() {
                return Err(ProvisionError::Validation("node name cannot be empty".into()));
            }
            if !names.insert(node.name.as_str()) {
                return Err(ProvisionError::Validation(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
        }

        if self.nodes_with_role(NodeRole::ControlPlane).next().is_none() {
            return Err(ProvisionError::Validation(
                "cluster needs at least one control-plane node".into(),
            ));
        }

        for account in [&self.admin_account, &self.image_account] {
            if account.is_empty()
                || !account
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
            {
                return Err(ProvisionError::Validation(format!(
                    "account name '{account}' must be lowercase letters, digits, '-' or '_'"
                )));
            }
        }

        self.ssh_port_range.validate()?;

        let api = IngressRule::control_plane_api();
        if self.ssh_port_range.contains(api.external_port) {
            return Err(ProvisionError::Validation(format!(
                "SSH range {} overlaps the cluster API port {}",
                self.ssh_port_range, api.external_port
            )));
        }

        for node in &self.nodes {
            let partitions = self.partitions_for(node.role);
            if let Some(partition) = node.partition {
                if partition == 0 || (partitions > 1 && partition > partitions) {
                    return Err(ProvisionError::Validation(format!(
                        "node '{}' requests partition {} but role {} has {} partition(s)",
                        node.name, partition, node.role, partitions
                    )));
                }
            }
        }

        let mut ports = HashSet::new();
        for node in &self.nodes {
            if let Some(port) = node.ssh_port {
                if !self.ssh_port_range.contains(port) {
                    return Err(ProvisionError::Validation(format!(
                        "node '{}' requests SSH port {} outside {}",
                        node.name, port, self.ssh_port_range
                    )));
                }
                if !ports.insert(port) {
                    return Err(ProvisionError::Validation(format!(
                        "SSH port {port} requested by more than one node"
                    )));
                }
            }
        }

        let mut listeners: BTreeSet<(Protocol, u16)> = BTreeSet::new();
        for rule in &self.ingress_rules {
            if (rule.protocol, rule.external_port) == (api.protocol, api.external_port) {
                return Err(ProvisionError::Validation(format!(
                    "ingress port {}/{} is reserved for the cluster API",
                    rule.protocol, rule.external_port
                )));
            }
            if self.ssh_port_range.contains(rule.external_port) {
                return Err(ProvisionError::Validation(format!(
                    "ingress port {} lies inside the reserved SSH range {}",
                    rule.external_port, self.ssh_port_range
                )));
            }
            if rule.external_port == 0 || rule.node_port == 0 {
                return Err(ProvisionError::Validation(
                    "ingress ports must be non-zero".into(),
                ));
            }
            if !listeners.insert((rule.protocol, rule.external_port)) {
                return Err(ProvisionError::Validation(format!(
                    "ingress port {}/{} declared more than once",
                    rule.protocol, rule.external_port
                )));
            }
        }

        Ok(())
    }
}

/// A single node declaration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    /// Stable node name, unique within the cluster
    pub name: String,
    pub role: NodeRole,
    pub instance_type: String,

    /// Size of the attached data volume
    #[serde(default = "default_data_volume_gb")]
    pub data_volume_gb: u32,

    /// Explicit placement partition (1-based)
    #[serde(default)]
    pub partition: Option<u32>,

    /// Explicit external SSH port
    #[serde(default)]
    pub ssh_port: Option<u16>,
}

fn default_data_volume_gb() -> u32 {
    100
}

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeRole {
    ControlPlane,
    Worker,
}

impl NodeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeRole::ControlPlane => "control-plane",
            NodeRole::Worker => "worker",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "control-plane" => Some(NodeRole::ControlPlane),
            "worker" => Some(NodeRole::Worker),
            _ => None,
        }
    }
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed port range `[start, end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.start <= port && port <= self.end
    }

    /// Number of ports in the range
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }

    pub fn validate(&self) -> Result<()> {
        if self.start == 0 || self.end < self.start {
            return Err(ProvisionError::Validation(format!(
                "invalid SSH port range {self}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Address plan of the cluster network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub cidr: String,
    pub public_subnet_cidr: String,
    pub private_subnet_cidr: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            cidr: "10.0.0.0/16".to_string(),
            public_subnet_cidr: "10.0.0.0/20".to_string(),
            private_subnet_cidr: "10.0.16.0/20".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ingress::IngressTarget;

    fn node(name: &str, role: NodeRole) -> NodeDefinition {
        NodeDefinition {
            name: name.to_string(),
            role,
            instance_type: "m5.large".to_string(),
            data_volume_gb: 100,
            partition: None,
            ssh_port: None,
        }
    }

    fn definition() -> ClusterDefinition {
        ClusterDefinition {
            name: "prod".to_string(),
            nodes: vec![node("cp1", NodeRole::ControlPlane), node("w1", NodeRole::Worker)],
            ingress_rules: vec![],
            ssh_port_range: PortRange::new(2222, 2232),
            ssh_access: None,
            control_plane_partitions: 1,
            worker_partitions: 1,
            network: NetworkSettings::default(),
            admin_account: "trellis".to_string(),
            image_account: "admin".to_string(),
            machine_image: "default".to_string(),
        }
    }

    #[test]
    fn test_valid_definition() {
        assert!(definition().validate().is_ok());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut def = definition();
        def.nodes.push(node("w1", NodeRole::Worker));
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate node name 'w1'"));
    }

    #[test]
    fn test_control_plane_required() {
        let mut def = definition();
        def.nodes.retain(|n| n.role == NodeRole::Worker);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_partition_override_out_of_range() {
        let mut def = definition();
        def.worker_partitions = 2;
        def.nodes[1].partition = Some(3);
        assert!(def.validate().is_err());

        def.nodes[1].partition = Some(2);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_ingress_inside_ssh_range_rejected() {
        let mut def = definition();
        def.ingress_rules.push(IngressRule {
            protocol: Protocol::Tcp,
            external_port: 2225,
            node_port: 30080,
            target: IngressTarget::UserIngress,
            source_cidrs: vec![],
            destination_cidrs: vec![],
            health_check: None,
        });
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_ingress_on_cluster_api_port_rejected() {
        let mut def = definition();
        def.ingress_rules.push(IngressRule {
            protocol: Protocol::Tcp,
            external_port: 6443,
            node_port: 30443,
            target: IngressTarget::UserIngress,
            source_cidrs: vec![],
            destination_cidrs: vec![],
            health_check: None,
        });
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("reserved for the cluster API"));

        def.ingress_rules[0].protocol = Protocol::Udp;
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_ssh_range_must_exclude_cluster_api_port() {
        let mut def = definition();
        def.ssh_port_range = PortRange::new(6400, 6500);
        let err = def.validate().unwrap_err();
        assert!(err.to_string().contains("overlaps the cluster API port"));
    }

    #[test]
    fn test_ssh_override_must_be_in_range() {
        let mut def = definition();
        def.nodes[0].ssh_port = Some(22);
        assert!(def.validate().is_err());

        def.nodes[0].ssh_port = Some(2230);
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_account_names_are_shell_safe() {
        let mut def = definition();
        def.admin_account = "ops; rm -rf /".to_string();
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_port_range_len() {
        assert_eq!(PortRange::new(2222, 2232).len(), 11);
        assert_eq!(PortRange::new(10, 9).len(), 0);
        assert!(PortRange::new(0, 10).validate().is_err());
    }

    #[test]
    fn test_from_json_applies_defaults() {
        let json = r#"{
            "name": "lab",
            "nodes": [{ "name": "cp1", "role": "control-plane", "instance_type": "t3.large" }],
            "ssh_port_range": { "start": 2222, "end": 2230 }
        }"#;
        let def = ClusterDefinition::from_json(json).unwrap();
        assert_eq!(def.control_plane_partitions, 1);
        assert_eq!(def.nodes[0].data_volume_gb, 100);
        assert_eq!(def.admin_account, "trellis");
        assert_eq!(def.image_account, "admin");
        assert_eq!(def.network.cidr, "10.0.0.0/16");
    }
}
