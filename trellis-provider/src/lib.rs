//! Trellis Provider
//!
//! The seam between the reconciliation engine and a cloud provider.
//!
//! The engine is written once against [`CloudApi`]. This crate ships two
//! implementations:
//! - [`HttpCloud`]: talks to a provider gateway over a provider-neutral JSON API
//! - [`InMemoryCloud`]: an in-process cloud that records every call, used by
//!   tests and dry runs
//!
//! # Example
//!
//! ```no_run
//! use trellis_core::domain::{ResourceKind, TagFilter};
//! use trellis_provider::{CloudApi, HttpCloud};
//!
//! # async fn example() -> Result<(), trellis_core::ProviderError> {
//! let cloud = HttpCloud::new("http://localhost:8787");
//! let networks = cloud
//!     .list(ResourceKind::Network, &TagFilter::cluster("prod"))
//!     .await?;
//! println!("found {} network(s)", networks.len());
//! # Ok(())
//! # }
//! ```

pub mod http;
pub mod memory;

pub use http::HttpCloud;
pub use memory::{ApiCall, InMemoryCloud};

use async_trait::async_trait;
use trellis_core::ProviderError;
use trellis_core::domain::{Attributes, Resource, ResourceKind, TagFilter, Tags};
use trellis_core::dto::{AclEntry, Association, CreateResource, InstanceAction};

/// Result type alias for provider calls
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Capability set every cloud provider exposes to the engine
///
/// All list operations are filterable by tag; the engine always scopes them
/// by the `cluster` tag.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Lists resources of a kind whose tags match the filter
    async fn list(&self, kind: ResourceKind, filter: &TagFilter) -> Result<Vec<Resource>>;

    /// Describes one resource by id, including its current state
    async fn describe(&self, kind: ResourceKind, id: &str) -> Result<Resource>;

    /// Creates a resource with the given attributes and tags
    async fn create(&self, request: CreateResource) -> Result<Resource>;

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()>;

    /// Adds or overwrites tags
    async fn tag(&self, kind: ResourceKind, id: &str, tags: &Tags) -> Result<()>;

    /// Sets attributes; an empty value clears the attribute
    async fn modify(&self, kind: ResourceKind, id: &str, attributes: &Attributes) -> Result<()>;

    /// Creates or replaces an association between two resources
    async fn associate(&self, association: &Association) -> Result<()>;

    /// Adds a route to a route table
    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target_id: &str,
    ) -> Result<()>;

    async fn instance_action(&self, instance_id: &str, action: InstanceAction) -> Result<()>;

    /// Volumes currently attached to an instance
    async fn attached_volumes(&self, instance_id: &str) -> Result<Vec<Resource>>;

    async fn acl_entries(&self, acl_id: &str) -> Result<Vec<AclEntry>>;

    /// Replaces every entry of an ACL in one operation
    async fn replace_acl_entries(&self, acl_id: &str, entries: &[AclEntry]) -> Result<()>;

    async fn registered_targets(&self, target_group_id: &str) -> Result<Vec<String>>;

    /// Replaces the member set of a target group
    async fn set_targets(&self, target_group_id: &str, instance_ids: &[String]) -> Result<()>;
}
