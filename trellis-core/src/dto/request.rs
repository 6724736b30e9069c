//! Mutation requests

use serde::{Deserialize, Serialize};

use crate::domain::resource::{Attributes, ResourceKind, Tags};

/// Request to create a resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateResource {
    pub kind: ResourceKind,
    pub attributes: Attributes,
    pub tags: Tags,
}

/// A link between two existing resources
///
/// Each association replaces any previous association of the same sort in a
/// single provider operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Association {
    InternetGateway {
        gateway_id: String,
        network_id: String,
    },
    RouteTable {
        route_table_id: String,
        subnet_id: String,
    },
    NetworkAcl {
        acl_id: String,
        subnet_id: String,
    },
}

/// Power actions on an instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceAction {
    Start,
    Stop,
    Terminate,
}

impl InstanceAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceAction::Start => "start",
            InstanceAction::Stop => "stop",
            InstanceAction::Terminate => "terminate",
        }
    }
}
