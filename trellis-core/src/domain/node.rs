//! Node runtime records

use serde::{Deserialize, Serialize};

use crate::domain::cluster::NodeRole;
use crate::domain::resource::{Resource, tags};

/// Lifecycle phase of a node's instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodePhase {
    Absent,
    Creating,
    Pending,
    Running,
    Stopping,
    Stopped,
    Starting,
    BootstrapClearing,
    /// Running with bootstrap data cleared; nothing left to do
    Ready,
}

impl std::fmt::Display for NodePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodePhase::Absent => "Absent",
            NodePhase::Creating => "Creating",
            NodePhase::Pending => "Pending",
            NodePhase::Running => "Running",
            NodePhase::Stopping => "Stopping",
            NodePhase::Stopped => "Stopped",
            NodePhase::Starting => "Starting",
            NodePhase::BootstrapClearing => "BootstrapClearing",
            NodePhase::Ready => "Ready",
        };
        f.write_str(name)
    }
}

/// Per-node runtime state
///
/// Created when a node's instance is discovered or first provisioned and
/// destroyed only when the node is deprovisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub name: String,
    pub role: NodeRole,
    pub instance: Option<Resource>,
    /// Volumes attached to the instance, as last tagged
    #[serde(default)]
    pub volumes: Vec<Resource>,
    pub ssh_port: Option<u16>,
    pub partition: Option<u32>,
    pub phase: NodePhase,
}

impl NodeRecord {
    /// A node with no provider presence yet
    pub fn absent(name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            role,
            instance: None,
            volumes: Vec::new(),
            ssh_port: None,
            partition: None,
            phase: NodePhase::Absent,
        }
    }

    /// Rebuilds a record from a discovered instance and its persisted tags
    ///
    /// Returns `None` when the instance does not carry node/role tags.
    pub fn from_instance(instance: Resource) -> Option<Self> {
        let name = instance.tag(tags::NODE)?.to_string();
        let role = NodeRole::parse(instance.tag(tags::ROLE)?)?;
        let ssh_port = instance.tag(tags::SSH_PORT).and_then(|p| p.parse().ok());
        let partition = instance.tag(tags::PARTITION).and_then(|p| p.parse().ok());

        Some(Self {
            name,
            role,
            instance: Some(instance),
            volumes: Vec::new(),
            ssh_port,
            partition,
            phase: NodePhase::Pending,
        })
    }

    pub fn instance_id(&self) -> Option<&str> {
        self.instance.as_ref().map(|instance| instance.id.as_str())
    }

    /// Whether the one-time bootstrap payload has already been wiped
    pub fn bootstrap_cleared(&self) -> bool {
        self.instance
            .as_ref()
            .and_then(|instance| instance.tag(tags::BOOTSTRAP_CLEARED))
            == Some("true")
    }
}
