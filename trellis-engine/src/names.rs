//! Logical names and attribute keys of engine-managed resources
//!
//! Logical names are written to the `name` tag and are the key discovery
//! uses to recognise a resource on a later run. They must stay stable.

use trellis_core::domain::{NodeRole, Protocol};

pub const NETWORK: &str = "network";
pub const PUBLIC_SUBNET: &str = "subnet-public";
pub const PRIVATE_SUBNET: &str = "subnet-private";
pub const PUBLIC_ROUTES: &str = "routes-public";
pub const PRIVATE_ROUTES: &str = "routes-private";
pub const INTERNET_GATEWAY: &str = "internet-gateway";
pub const NAT_ADDRESS: &str = "nat-address";
pub const NAT_GATEWAY: &str = "nat-gateway";
pub const SECURITY_GROUP: &str = "nodes";
pub const LOAD_BALANCER: &str = "load-balancer";

/// Destination block of a default route
pub const DEFAULT_ROUTE: &str = "0.0.0.0/0";

/// One of the two ACLs kept per subnet
pub fn acl(subnet: &str, slot: char) -> String {
    format!("acl-{subnet}-{slot}")
}

pub fn placement_group(role: NodeRole) -> String {
    format!("placement-{}", role.as_str())
}

pub fn listener(protocol: Protocol, port: u16) -> String {
    format!("listener-{}-{}", protocol.as_str(), port)
}

/// Device the data volume is attached as
pub const DATA_DEVICE: &str = "/dev/sdb";

/// Name of a volume attached to a node, derived from its device
pub fn volume(node: &str, device: &str) -> String {
    let device = device.rsplit('/').next().unwrap_or(device);
    format!("{node}-{device}")
}

/// Attribute keys the engine sets on created resources
pub mod keys {
    pub const CIDR: &str = "cidr";
    pub const NETWORK: &str = "network";
    pub const SUBNET: &str = "subnet";
    pub const PUBLIC: &str = "public";
    pub const ENABLE_DNS_SUPPORT: &str = "enable-dns-support";
    pub const ENABLE_DNS_HOSTNAMES: &str = "enable-dns-hostnames";
    pub const ALLOCATION: &str = "allocation";
    pub const SCHEME: &str = "scheme";
    pub const STRATEGY: &str = "strategy";
    pub const PARTITIONS: &str = "partitions";
    pub const PROTOCOL: &str = "protocol";
    pub const PORT: &str = "port";
    pub const LOAD_BALANCER: &str = "load-balancer";
    pub const TARGET_GROUP: &str = "target-group";
    pub const HEALTH_PROTOCOL: &str = "health-protocol";
    pub const HEALTH_PORT: &str = "health-port";
    pub const HEALTH_PATH: &str = "health-path";
    pub const INSTANCE_TYPE: &str = "instance-type";
    pub const IMAGE: &str = "image";
    pub const SECURITY_GROUP: &str = "security-group";
    pub const PLACEMENT_GROUP: &str = "placement-group";
    pub const PARTITION: &str = "partition";
    pub const DEVICE: &str = "device";
    pub const SIZE_GB: &str = "size-gb";
    pub const DATA_VOLUME_GB: &str = "data-volume-gb";
}
