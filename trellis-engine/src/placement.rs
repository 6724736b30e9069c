//! Placement step
//!
//! Ensures one partition placement group per role, then gives every declared
//! node its partition and SSH port. Values persisted on existing instances
//! win; overrides in the definition must agree with them.

use std::collections::BTreeMap;

use tracing::{debug, info};
use trellis_core::domain::{ClusterDefinition, NodeRecord, NodeRole, ResourceKind};
use trellis_core::{ProvisionError, Result};

use crate::names::{self, keys};
use crate::partition::{PartitionRequest, assign_partitions};
use crate::ports::{PortRequest, allocate_ports};
use crate::progress::StepReporter;
use crate::reconciler::{Reconciler, ResourceSpec};
use crate::registry::NodeRegistry;
use crate::table::ReconciliationTable;

const ROLES: [NodeRole; 2] = [NodeRole::ControlPlane, NodeRole::Worker];

pub struct PlacementPlanner<'a> {
    reconciler: &'a Reconciler,
    definition: &'a ClusterDefinition,
}

impl<'a> PlacementPlanner<'a> {
    pub fn new(reconciler: &'a Reconciler, definition: &'a ClusterDefinition) -> Self {
        Self {
            reconciler,
            definition,
        }
    }

    pub async fn apply(
        &self,
        table: &mut ReconciliationTable,
        nodes: &mut NodeRegistry,
        reporter: &StepReporter,
    ) -> Result<()> {
        for role in ROLES {
            if self.definition.nodes_with_role(role).next().is_none() {
                continue;
            }
            let name = names::placement_group(role);
            if table.get(ResourceKind::PlacementGroup, &name).is_none() {
                reporter.status(format!("create: {} placement group", role));
            }
            let partitions = self.definition.partitions_for(role).max(1);
            let spec = ResourceSpec::new(ResourceKind::PlacementGroup, name)
                .defining(keys::STRATEGY, "partition")
                .defining(keys::PARTITIONS, partitions.to_string());
            self.reconciler.ensure(table, spec).await?;
        }

        for record in plan_nodes(self.definition, nodes)? {
            debug!(
                "Node {} placed in partition {:?} with SSH port {:?}",
                record.name, record.partition, record.ssh_port
            );
            nodes.upsert(record);
        }
        info!("Placed {} node(s)", self.definition.nodes.len());
        Ok(())
    }
}

/// Computes the placed record of every declared node
///
/// Records come back in declaration order. Nothing is written to the
/// registry.
pub fn plan_nodes(definition: &ClusterDefinition, nodes: &NodeRegistry) -> Result<Vec<NodeRecord>> {
    let mut records = Vec::with_capacity(definition.nodes.len());
    for node in &definition.nodes {
        let mut record = nodes
            .get(&node.name)
            .cloned()
            .unwrap_or_else(|| NodeRecord::absent(&node.name, node.role));

        if record.role != node.role {
            return Err(ProvisionError::conflict(
                ResourceKind::Instance,
                &node.name,
                format!(
                    "existing instance is a {} node but {} is declared",
                    record.role, node.role
                ),
            ));
        }
        record.partition = agree(&node.name, "partition", record.partition, node.partition)?;
        record.ssh_port = agree(&node.name, "SSH port", record.ssh_port, node.ssh_port)?;
        records.push(record);
    }

    let mut partitions = BTreeMap::new();
    for role in ROLES {
        let requests: Vec<PartitionRequest> = records
            .iter()
            .filter(|record| record.role == role)
            .map(|record| PartitionRequest::new(&record.name, record.partition))
            .collect();
        if requests.is_empty() {
            continue;
        }
        partitions.extend(assign_partitions(definition.partitions_for(role), &requests)?);
    }

    let requests: Vec<PortRequest> = records
        .iter()
        .map(|record| PortRequest::new(&record.name, record.role, record.ssh_port))
        .collect();
    let ports = allocate_ports(definition.ssh_port_range, &requests)?;

    for record in &mut records {
        record.partition = partitions.get(&record.name).copied();
        record.ssh_port = ports.get(&record.name).copied();
    }
    Ok(records)
}

/// Merges a persisted value with a declared override
fn agree<T>(node: &str, what: &str, persisted: Option<T>, declared: Option<T>) -> Result<Option<T>>
where
    T: PartialEq + std::fmt::Display + Copy,
{
    match (persisted, declared) {
        (Some(actual), Some(wanted)) if actual != wanted => Err(ProvisionError::conflict(
            ResourceKind::Instance,
            node,
            format!("instance already has {what} {actual} but {wanted} is declared"),
        )),
        (persisted, declared) => Ok(persisted.or(declared)),
    }
}
