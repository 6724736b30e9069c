//! Provider resource types
//!
//! Every resource the provisioner creates carries a `cluster=<name>` tag and a
//! `name=<logical-name>` tag. Discovery filters by cluster first, then matches
//! the logical name, so `(kind, cluster, name)` identifies one resource.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Resource tags (key -> value)
pub type Tags = BTreeMap<String, String>;

/// Provider-side attributes of a resource (key -> value)
pub type Attributes = BTreeMap<String, String>;

/// Well-known tag keys
pub mod tags {
    pub const CLUSTER: &str = "cluster";
    pub const NAME: &str = "name";
    pub const NODE: &str = "node";
    pub const ROLE: &str = "role";
    pub const PARTITION: &str = "partition";
    pub const SSH_PORT: &str = "ssh-port";
    pub const BOOTSTRAP_CLEARED: &str = "bootstrap-cleared";
    pub const SSH_ENABLED: &str = "ssh-enabled";
}

/// Well-known attribute keys that the provider maintains itself
pub mod attrs {
    /// Set on an internet gateway once attached to a network
    pub const ATTACHED_NETWORK: &str = "attached-network";
    /// Set on a subnet once a route table is associated
    pub const ROUTE_TABLE: &str = "route-table";
    /// Set on a subnet to the currently associated network ACL
    pub const NETWORK_ACL: &str = "network-acl";
    /// Set on a volume to the instance it is attached to
    pub const ATTACHED_TO: &str = "attached-to";
    /// Instance first-boot payload
    pub const USER_DATA: &str = "user-data";
    /// Volume flag
    pub const DELETE_ON_TERMINATION: &str = "delete-on-termination";

    /// Attribute key under which a route table records a route
    pub fn route(destination: &str) -> String {
        format!("route:{destination}")
    }
}

/// Common lifecycle state strings reported by providers
pub mod states {
    pub const PENDING: &str = "pending";
    pub const AVAILABLE: &str = "available";
    pub const PROVISIONING: &str = "provisioning";
    pub const ACTIVE: &str = "active";
    pub const IN_USE: &str = "in-use";
    pub const CREATING: &str = "creating";
    pub const ATTACHING: &str = "attaching";
    pub const FAILED: &str = "failed";
    pub const DELETED: &str = "deleted";
}

/// Kinds of provider resources managed by the provisioner
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Network,
    Subnet,
    RouteTable,
    InternetGateway,
    ElasticAddress,
    NatGateway,
    SecurityGroup,
    NetworkAcl,
    LoadBalancer,
    TargetGroup,
    Listener,
    PlacementGroup,
    Instance,
    Volume,
}

impl ResourceKind {
    /// Every kind, in dependency order
    pub const ALL: [ResourceKind; 14] = [
        ResourceKind::Network,
        ResourceKind::Subnet,
        ResourceKind::RouteTable,
        ResourceKind::InternetGateway,
        ResourceKind::ElasticAddress,
        ResourceKind::NatGateway,
        ResourceKind::SecurityGroup,
        ResourceKind::NetworkAcl,
        ResourceKind::LoadBalancer,
        ResourceKind::TargetGroup,
        ResourceKind::Listener,
        ResourceKind::PlacementGroup,
        ResourceKind::Instance,
        ResourceKind::Volume,
    ];

    /// Stable kebab-case name, also used as the URL segment by HTTP providers
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::RouteTable => "route-table",
            ResourceKind::InternetGateway => "internet-gateway",
            ResourceKind::ElasticAddress => "elastic-address",
            ResourceKind::NatGateway => "nat-gateway",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::NetworkAcl => "network-acl",
            ResourceKind::LoadBalancer => "load-balancer",
            ResourceKind::TargetGroup => "target-group",
            ResourceKind::Listener => "listener",
            ResourceKind::PlacementGroup => "placement-group",
            ResourceKind::Instance => "instance",
            ResourceKind::Volume => "volume",
        }
    }

    /// Short prefix for generated resource ids
    pub fn id_prefix(&self) -> &'static str {
        match self {
            ResourceKind::Network => "net",
            ResourceKind::Subnet => "subnet",
            ResourceKind::RouteTable => "rtb",
            ResourceKind::InternetGateway => "igw",
            ResourceKind::ElasticAddress => "eip",
            ResourceKind::NatGateway => "nat",
            ResourceKind::SecurityGroup => "sg",
            ResourceKind::NetworkAcl => "acl",
            ResourceKind::LoadBalancer => "lb",
            ResourceKind::TargetGroup => "tg",
            ResourceKind::Listener => "lsn",
            ResourceKind::PlacementGroup => "pg",
            ResourceKind::Instance => "i",
            ResourceKind::Volume => "vol",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource as described by the provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    pub kind: ResourceKind,
    pub id: String,
    pub state: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub attributes: Attributes,
}

impl Resource {
    /// The logical name carried in the `name` tag
    pub fn logical_name(&self) -> Option<&str> {
        self.tag(tags::NAME)
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.state == state
    }

    /// Human-readable label used in logs and errors, e.g. `subnet 'subnet-public' (subnet-1a2b)`
    pub fn label(&self) -> String {
        match self.logical_name() {
            Some(name) => format!("{} '{}' ({})", self.kind, name, self.id),
            None => format!("{} {}", self.kind, self.id),
        }
    }
}

/// Conjunctive tag filter used by list/describe calls
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagFilter {
    pub tags: Tags,
}

impl TagFilter {
    /// Filter matching every resource of one cluster
    pub fn cluster(cluster: &str) -> Self {
        Self::default().and(tags::CLUSTER, cluster)
    }

    /// Add a required `key=value` pair
    pub fn and(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Returns true when every required pair is present in `tags`
    pub fn matches(&self, tags: &Tags) -> bool {
        self.tags
            .iter()
            .all(|(key, value)| tags.get(key).is_some_and(|v| v == value))
    }
}

/// Instance states reported by providers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
    Other(String),
}

impl InstanceState {
    pub const PENDING: &'static str = "pending";
    pub const RUNNING: &'static str = "running";
    pub const STOPPING: &'static str = "stopping";
    pub const STOPPED: &'static str = "stopped";
    pub const SHUTTING_DOWN: &'static str = "shutting-down";
    pub const TERMINATED: &'static str = "terminated";

    pub fn parse(state: &str) -> Self {
        match state {
            Self::PENDING => InstanceState::Pending,
            Self::RUNNING => InstanceState::Running,
            Self::STOPPING => InstanceState::Stopping,
            Self::STOPPED => InstanceState::Stopped,
            Self::SHUTTING_DOWN => InstanceState::ShuttingDown,
            Self::TERMINATED => InstanceState::Terminated,
            other => InstanceState::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            InstanceState::Pending => Self::PENDING,
            InstanceState::Running => Self::RUNNING,
            InstanceState::Stopping => Self::STOPPING,
            InstanceState::Stopped => Self::STOPPED,
            InstanceState::ShuttingDown => Self::SHUTTING_DOWN,
            InstanceState::Terminated => Self::TERMINATED,
            InstanceState::Other(state) => state,
        }
    }
}
