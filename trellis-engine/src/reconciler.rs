//! Resource reconciler
//!
//! Tag-based discovery and create-if-absent. A resource belongs to a cluster
//! when it carries the `cluster` tag; its `name` tag is the logical name that
//! identifies it across runs. Attributes marked as *defining* must match
//! the declared resource, otherwise the resource was made for something
//! else and reusing it would be wrong.

use std::sync::Arc;

use tracing::{debug, info};
use trellis_core::domain::resource::{states, tags};
use trellis_core::domain::{Attributes, InstanceState, Resource, ResourceKind, TagFilter, Tags};
use trellis_core::dto::CreateResource;
use trellis_core::{ProvisionError, Result};
use trellis_provider::CloudApi;

use crate::table::ReconciliationTable;

/// Declared shape of one resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSpec {
    pub kind: ResourceKind,
    /// Logical name, written to the `name` tag
    pub name: String,
    /// Attributes that must match on a reused resource
    pub defining: Attributes,
    /// Attributes only applied when the resource is created
    pub attributes: Attributes,
    /// Tags applied at creation in addition to `cluster` and `name`
    pub tags: Tags,
}

impl ResourceSpec {
    pub fn new(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            defining: Attributes::new(),
            attributes: Attributes::new(),
            tags: Tags::new(),
        }
    }

    pub fn defining(mut self, key: &str, value: impl Into<String>) -> Self {
        self.defining.insert(key.to_string(), value.into());
        self
    }

    pub fn attribute(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    pub fn tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key.to_string(), value.into());
        self
    }
}

/// Discovers and ensures resources of one cluster
pub struct Reconciler {
    api: Arc<dyn CloudApi>,
    cluster: String,
}

impl Reconciler {
    pub fn new(api: Arc<dyn CloudApi>, cluster: impl Into<String>) -> Self {
        Self {
            api,
            cluster: cluster.into(),
        }
    }

    pub fn api(&self) -> &dyn CloudApi {
        self.api.as_ref()
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Filter matching every resource of this cluster
    pub fn cluster_filter(&self) -> TagFilter {
        TagFilter::cluster(&self.cluster)
    }

    // =============================================================================
    // Discovery
    // =============================================================================

    /// Lists every resource kind and builds the table of this cluster
    ///
    /// Terminated resources and resources without a logical name are skipped.
    /// Two live resources with the same kind and logical name are a conflict.
    pub async fn discover_all(&self) -> Result<ReconciliationTable> {
        let filter = self.cluster_filter();
        let mut table = ReconciliationTable::new();

        for kind in ResourceKind::ALL {
            for resource in self.api.list(kind, &filter).await? {
                if is_retired(&resource) {
                    debug!("Skipping retired {}", resource.label());
                    continue;
                }
                let Some(name) = resource.logical_name().map(str::to_string) else {
                    debug!("Skipping unnamed {} {}", kind, resource.id);
                    continue;
                };
                if let Some(other) = table.get(kind, &name) {
                    return Err(duplicate(kind, &name, &other.id, &resource.id));
                }
                table.insert(resource);
            }
        }

        info!(
            "Discovered {} resource(s) for cluster '{}'",
            table.len(),
            self.cluster
        );
        Ok(table)
    }

    /// Looks up a single resource by logical name
    pub async fn discover(&self, kind: ResourceKind, name: &str) -> Result<Option<Resource>> {
        let filter = self.cluster_filter().and(tags::NAME, name);
        let mut found = self
            .api
            .list(kind, &filter)
            .await?
            .into_iter()
            .filter(|resource| !is_retired(resource));

        let first = found.next();
        if let (Some(first), Some(second)) = (&first, found.next()) {
            return Err(duplicate(kind, name, &first.id, &second.id));
        }
        Ok(first)
    }

    // =============================================================================
    // Create-if-absent
    // =============================================================================

    /// Reuses the table entry for `spec` or creates it, and records the result
    pub async fn ensure(&self, table: &mut ReconciliationTable, spec: ResourceSpec) -> Result<Resource> {
        let existing = table.get(spec.kind, &spec.name).cloned();
        let resource = self.ensure_with(existing.as_ref(), spec).await?;
        table.insert(resource.clone());
        Ok(resource)
    }

    /// Reuses `existing` after checking its purpose, or creates `spec`
    pub async fn ensure_with(&self, existing: Option<&Resource>, spec: ResourceSpec) -> Result<Resource> {
        if let Some(existing) = existing {
            check_purpose(existing, &spec)?;
            debug!("Reusing {}", existing.label());
            return Ok(existing.clone());
        }

        let ResourceSpec {
            kind,
            name,
            defining,
            attributes,
            tags: mut labels,
        } = spec;

        let mut all_attributes = attributes;
        all_attributes.extend(defining);
        labels.insert(tags::CLUSTER.to_string(), self.cluster.clone());
        labels.insert(tags::NAME.to_string(), name.clone());

        info!("Creating {} '{}'", kind, name);
        let created = self
            .api
            .create(CreateResource {
                kind,
                attributes: all_attributes,
                tags: labels,
            })
            .await?;
        debug!("Created {}", created.label());
        Ok(created)
    }

    /// Deletes a recorded resource and drops it from the table
    ///
    /// Returns false when nothing was recorded under that name.
    pub async fn retire(
        &self,
        table: &mut ReconciliationTable,
        kind: ResourceKind,
        name: &str,
    ) -> Result<bool> {
        let Some(resource) = table.remove(kind, name) else {
            return Ok(false);
        };
        info!("Deleting {}", resource.label());
        match self.api.delete(kind, &resource.id).await {
            Err(e) if !e.is_not_found() => Err(e.into()),
            _ => Ok(true),
        }
    }

    // =============================================================================
    // In-place convergence
    // =============================================================================

    /// Applies the tags that differ from `desired` and mirrors them locally
    ///
    /// Returns true when a provider call was made.
    pub async fn sync_tags(&self, resource: &mut Resource, desired: &Tags) -> Result<bool> {
        let missing: Tags = desired
            .iter()
            .filter(|(key, value)| resource.tag(key) != Some(value.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if missing.is_empty() {
            return Ok(false);
        }

        self.api.tag(resource.kind, &resource.id, &missing).await?;
        resource.tags.extend(missing);
        Ok(true)
    }

    /// Applies the attributes that differ from `desired` and mirrors them locally
    ///
    /// An empty desired value means the attribute must be absent.
    pub async fn sync_attributes(&self, resource: &mut Resource, desired: &Attributes) -> Result<bool> {
        let changed: Attributes = desired
            .iter()
            .filter(|(key, value)| match resource.attribute(key) {
                Some(current) => current != value.as_str(),
                None => !value.is_empty(),
            })
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        if changed.is_empty() {
            return Ok(false);
        }

        self.api
            .modify(resource.kind, &resource.id, &changed)
            .await?;
        for (key, value) in changed {
            if value.is_empty() {
                resource.attributes.remove(&key);
            } else {
                resource.attributes.insert(key, value);
            }
        }
        Ok(true)
    }
}

/// Fails when a reused resource disagrees with a defining attribute
pub fn check_purpose(existing: &Resource, spec: &ResourceSpec) -> Result<()> {
    for (key, declared) in &spec.defining {
        match existing.attribute(key) {
            Some(actual) if actual == declared => {}
            actual => {
                return Err(ProvisionError::conflict(
                    spec.kind,
                    &spec.name,
                    format!(
                        "{} ({}) has {}={} but {} is declared",
                        existing.id,
                        spec.kind,
                        key,
                        actual.unwrap_or("<unset>"),
                        declared
                    ),
                ));
            }
        }
    }
    Ok(())
}

/// Resources that linger in listings after deletion
fn is_retired(resource: &Resource) -> bool {
    match resource.kind {
        ResourceKind::Instance => resource.has_state(InstanceState::TERMINATED),
        ResourceKind::NatGateway => {
            resource.has_state(states::DELETED) || resource.has_state(states::FAILED)
        }
        _ => resource.has_state(states::DELETED),
    }
}

fn duplicate(kind: ResourceKind, name: &str, first: &str, second: &str) -> ProvisionError {
    ProvisionError::conflict(
        kind,
        name,
        format!("more than one live resource carries this name ({first}, {second})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_provider::InMemoryCloud;
    use trellis_provider::memory::ApiCall;

    fn reconciler() -> (Arc<InMemoryCloud>, Reconciler) {
        let cloud = Arc::new(InMemoryCloud::new());
        let reconciler = Reconciler::new(cloud.clone(), "demo");
        (cloud, reconciler)
    }

    fn subnet_spec(cidr: &str) -> ResourceSpec {
        ResourceSpec::new(ResourceKind::Subnet, "subnet-public")
            .defining("cidr", cidr)
            .attribute("public", "true")
    }

    #[tokio::test]
    async fn test_ensure_creates_once() {
        let (cloud, reconciler) = reconciler();
        let mut table = ReconciliationTable::new();

        let first = reconciler
            .ensure(&mut table, subnet_spec("10.0.0.0/20"))
            .await
            .unwrap();
        assert_eq!(first.tag("cluster"), Some("demo"));
        assert_eq!(first.logical_name(), Some("subnet-public"));
        assert_eq!(first.attribute("public"), Some("true"));

        let second = reconciler
            .ensure(&mut table, subnet_spec("10.0.0.0/20"))
            .await
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(cloud.creates(), 1);
    }

    #[tokio::test]
    async fn test_rerun_discovers_instead_of_creating() {
        let (cloud, reconciler) = reconciler();
        let mut table = ReconciliationTable::new();
        reconciler
            .ensure(&mut table, subnet_spec("10.0.0.0/20"))
            .await
            .unwrap();

        let mut rediscovered = reconciler.discover_all().await.unwrap();
        assert_eq!(rediscovered, table);

        cloud.reset_calls();
        reconciler
            .ensure(&mut rediscovered, subnet_spec("10.0.0.0/20"))
            .await
            .unwrap();
        assert_eq!(cloud.creates(), 0);
    }

    #[tokio::test]
    async fn test_defining_attribute_mismatch_is_a_conflict() {
        let (_cloud, reconciler) = reconciler();
        let mut table = ReconciliationTable::new();
        reconciler
            .ensure(&mut table, subnet_spec("10.0.0.0/20"))
            .await
            .unwrap();

        let error = reconciler
            .ensure(&mut table, subnet_spec("10.9.0.0/20"))
            .await
            .unwrap_err();
        assert!(matches!(
            error,
            ProvisionError::Conflict {
                kind: ResourceKind::Subnet,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_other_clusters_are_invisible() {
        let (_cloud, reconciler) = reconciler();
        let other = Reconciler::new(reconciler.api.clone(), "other");
        let mut table = ReconciliationTable::new();
        other
            .ensure(&mut table, subnet_spec("10.0.0.0/20"))
            .await
            .unwrap();

        assert!(reconciler.discover_all().await.unwrap().is_empty());
        assert!(
            reconciler
                .discover(ResourceKind::Subnet, "subnet-public")
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_duplicate_names_are_a_conflict() {
        let (cloud, reconciler) = reconciler();
        for _ in 0..2 {
            reconciler
                .ensure_with(None, subnet_spec("10.0.0.0/20"))
                .await
                .unwrap();
        }
        assert_eq!(cloud.creates(), 2);

        assert!(matches!(
            reconciler.discover_all().await,
            Err(ProvisionError::Conflict { .. })
        ));
        assert!(matches!(
            reconciler
                .discover(ResourceKind::Subnet, "subnet-public")
                .await,
            Err(ProvisionError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_sync_only_touches_differences() {
        let (cloud, reconciler) = reconciler();
        let mut resource = reconciler
            .ensure_with(None, ResourceSpec::new(ResourceKind::Network, "network"))
            .await
            .unwrap();

        let mut desired = Tags::new();
        desired.insert("ssh-enabled".into(), "true".into());
        assert!(reconciler.sync_tags(&mut resource, &desired).await.unwrap());
        assert!(!reconciler.sync_tags(&mut resource, &desired).await.unwrap());

        let mut attributes = Attributes::new();
        attributes.insert("enable-dns-support".into(), "true".into());
        attributes.insert("user-data".into(), String::new());
        assert!(
            reconciler
                .sync_attributes(&mut resource, &attributes)
                .await
                .unwrap()
        );
        assert!(
            !reconciler
                .sync_attributes(&mut resource, &attributes)
                .await
                .unwrap()
        );

        assert_eq!(cloud.count(|c| matches!(c, ApiCall::Tag(_))), 1);
        assert_eq!(cloud.count(|c| matches!(c, ApiCall::Modify(_))), 1);
        assert_eq!(cloud.resource(&resource.id).unwrap(), resource);
    }

    #[tokio::test]
    async fn test_retire_deletes_and_forgets() {
        let (cloud, reconciler) = reconciler();
        let mut table = ReconciliationTable::new();
        reconciler
            .ensure(&mut table, subnet_spec("10.0.0.0/20"))
            .await
            .unwrap();

        assert!(
            reconciler
                .retire(&mut table, ResourceKind::Subnet, "subnet-public")
                .await
                .unwrap()
        );
        assert!(table.is_empty());
        assert!(cloud.resources(ResourceKind::Subnet).is_empty());
        assert!(
            !reconciler
                .retire(&mut table, ResourceKind::Subnet, "subnet-public")
                .await
                .unwrap()
        );
    }
}
