//! Ingress rule declarations
//!
//! Rules are declared externally. The engine derives target groups, listeners
//! and network ACL entries from them but never mutates the rule set.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Port the cluster API server listens on
pub const CONTROL_PLANE_API_PORT: u16 = 6443;

/// Transport protocol of an ingress rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which nodes receive the traffic of a rule
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngressTarget {
    ControlPlane,
    #[default]
    UserIngress,
}

impl IngressTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngressTarget::ControlPlane => "control-plane",
            IngressTarget::UserIngress => "user-ingress",
        }
    }
}

impl fmt::Display for IngressTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol used by load balancer health checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthCheckProtocol {
    Tcp,
    Http,
    Https,
}

impl HealthCheckProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthCheckProtocol::Tcp => "tcp",
            HealthCheckProtocol::Http => "http",
            HealthCheckProtocol::Https => "https",
        }
    }
}

/// Health check override for the target group backing a rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub protocol: HealthCheckProtocol,
    /// Defaults to the rule's node port
    #[serde(default)]
    pub port: Option<u16>,
    /// Only meaningful for HTTP(S) checks
    #[serde(default)]
    pub path: Option<String>,
}

/// A declared ingress rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressRule {
    pub protocol: Protocol,
    /// Port exposed on the load balancer
    pub external_port: u16,
    /// Port the traffic is forwarded to on the nodes
    pub node_port: u16,
    #[serde(default)]
    pub target: IngressTarget,
    /// Source address blocks allowed in; empty means anywhere
    #[serde(default)]
    pub source_cidrs: Vec<String>,
    /// Subnet address blocks the rule opens on; empty means every cluster subnet
    #[serde(default)]
    pub destination_cidrs: Vec<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

impl IngressRule {
    /// The fixed rule exposing the cluster API on the control plane
    pub fn control_plane_api() -> Self {
        Self {
            protocol: Protocol::Tcp,
            external_port: CONTROL_PLANE_API_PORT,
            node_port: CONTROL_PLANE_API_PORT,
            target: IngressTarget::ControlPlane,
            source_cidrs: vec![],
            destination_cidrs: vec![],
            health_check: Some(HealthCheck {
                protocol: HealthCheckProtocol::Https,
                port: None,
                path: Some("/readyz".to_string()),
            }),
        }
    }

    /// Effective health check for the rule's target group
    pub fn effective_health_check(&self) -> HealthCheck {
        self.health_check.clone().unwrap_or(HealthCheck {
            protocol: HealthCheckProtocol::Tcp,
            port: None,
            path: None,
        })
    }

    /// Source blocks, defaulting to anywhere
    pub fn sources(&self) -> Vec<String> {
        if self.source_cidrs.is_empty() {
            vec!["0.0.0.0/0".to_string()]
        } else {
            self.source_cidrs.clone()
        }
    }

    /// Whether the rule opens on the subnet with the given block
    pub fn applies_to_subnet(&self, subnet_cidr: &str) -> bool {
        self.destination_cidrs.is_empty()
            || self
                .destination_cidrs
                .iter()
                .any(|cidr| cidr == subnet_cidr || cidr == "0.0.0.0/0")
    }
}
