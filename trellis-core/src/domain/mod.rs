//! Core domain types
//!
//! This module contains the structures shared between the provider layer
//! (which stores and returns resources) and the engine (which reconciles them).

pub mod cluster;
pub mod ingress;
pub mod node;
pub mod resource;

pub use cluster::{ClusterDefinition, NetworkSettings, NodeDefinition, NodeRole, PortRange};
pub use ingress::{HealthCheck, HealthCheckProtocol, IngressRule, IngressTarget, Protocol};
pub use node::{NodePhase, NodeRecord};
pub use resource::{Attributes, InstanceState, Resource, ResourceKind, TagFilter, Tags};
