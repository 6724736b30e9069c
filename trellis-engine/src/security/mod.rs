//! Security and load-balancing manager
//!
//! Owns the node security group, the per-subnet network ACLs, the network
//! load balancer and the traffic routing behind it (target groups,
//! listeners, per-node SSH access).

pub mod acl;
pub mod routing;

use tracing::debug;
use trellis_core::Result;
use trellis_core::domain::resource::{states, tags};
use trellis_core::domain::{ClusterDefinition, Resource, ResourceKind};

use crate::names::{self, keys};
use crate::poller::{PollSettings, wait_for_state};
use crate::progress::StepReporter;
use crate::reconciler::{Reconciler, ResourceSpec};
use crate::table::ReconciliationTable;

use self::acl::{AclSwapper, SubnetRole, subnet_rules};

/// Whether per-node SSH access is on for this run
///
/// An explicit request in the definition wins; otherwise the flag persisted
/// on the network is kept. A cluster without a network has SSH off.
pub fn resolve_ssh_access(definition: &ClusterDefinition, table: &ReconciliationTable) -> bool {
    definition.ssh_access.unwrap_or_else(|| {
        table
            .get(ResourceKind::Network, names::NETWORK)
            .and_then(|network| network.tag(tags::SSH_ENABLED))
            == Some("true")
    })
}

pub struct SecurityManager<'a> {
    reconciler: &'a Reconciler,
    definition: &'a ClusterDefinition,
    poll: &'a PollSettings,
}

impl<'a> SecurityManager<'a> {
    pub fn new(reconciler: &'a Reconciler, definition: &'a ClusterDefinition, poll: &'a PollSettings) -> Self {
        Self {
            reconciler,
            definition,
            poll,
        }
    }

    /// Ensures the security group, both subnet ACLs and the load balancer
    pub async fn apply(
        &self,
        table: &mut ReconciliationTable,
        ssh_enabled: bool,
        reporter: &StepReporter,
    ) -> Result<()> {
        self.ensure_security_group(table, reporter).await?;

        let swapper = AclSwapper::new(self.reconciler, self.poll);
        for role in [SubnetRole::Public, SubnetRole::Private] {
            let rules = subnet_rules(self.definition, role, ssh_enabled);
            let outcome = swapper
                .apply(table, role.logical_name(), rules, reporter)
                .await?;
            debug!("ACL of {}: {:?}", role.logical_name(), outcome);
        }

        self.ensure_load_balancer(table, reporter).await?;
        Ok(())
    }

    /// Security group shared by every node
    ///
    /// Admits all traffic from inside the network. Per-port filtering is
    /// done by the subnet ACLs.
    pub async fn ensure_security_group(
        &self,
        table: &mut ReconciliationTable,
        reporter: &StepReporter,
    ) -> Result<Resource> {
        let network = table.require(ResourceKind::Network, names::NETWORK)?.clone();
        if table.get(ResourceKind::SecurityGroup, names::SECURITY_GROUP).is_none() {
            reporter.status("create: security group");
        }
        let spec = ResourceSpec::new(ResourceKind::SecurityGroup, names::SECURITY_GROUP)
            .defining(keys::NETWORK, &network.id)
            .attribute("ingress", self.definition.network.cidr.clone())
            .attribute("egress", "0.0.0.0/0");
        self.reconciler.ensure(table, spec).await
    }

    /// Network load balancer in the public subnet, polled until active
    pub async fn ensure_load_balancer(
        &self,
        table: &mut ReconciliationTable,
        reporter: &StepReporter,
    ) -> Result<Resource> {
        let public = table.require(ResourceKind::Subnet, names::PUBLIC_SUBNET)?.clone();
        if table.get(ResourceKind::LoadBalancer, names::LOAD_BALANCER).is_none() {
            reporter.status("create: load balancer");
        }
        let spec = ResourceSpec::new(ResourceKind::LoadBalancer, names::LOAD_BALANCER)
            .defining(keys::SUBNET, &public.id)
            .defining(keys::SCHEME, "internet-facing")
            .attribute("type", "network");
        let balancer = self.reconciler.ensure(table, spec).await?;
        if balancer.has_state(states::ACTIVE) {
            return Ok(balancer);
        }

        reporter.status("wait: load balancer active");
        let balancer = wait_for_state(
            self.reconciler.api(),
            ResourceKind::LoadBalancer,
            &balancer.id,
            states::ACTIVE,
            &[states::PROVISIONING],
            self.poll,
        )
        .await?;
        table.insert(balancer.clone());
        Ok(balancer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use trellis_core::domain::{NetworkSettings, NodeDefinition, NodeRole, PortRange};
    use trellis_provider::InMemoryCloud;
    use trellis_provider::memory::ApiCall;

    use crate::network::NetworkTopologyBuilder;

    fn definition(ssh_access: Option<bool>) -> ClusterDefinition {
        ClusterDefinition {
            name: "demo".into(),
            nodes: vec![NodeDefinition {
                name: "cp1".into(),
                role: NodeRole::ControlPlane,
                instance_type: "m5.large".into(),
                data_volume_gb: 100,
                partition: None,
                ssh_port: None,
            }],
            ingress_rules: vec![],
            ssh_port_range: PortRange::new(2222, 2232),
            ssh_access,
            control_plane_partitions: 1,
            worker_partitions: 1,
            network: NetworkSettings::default(),
            admin_account: "trellis".into(),
            image_account: "admin".into(),
            machine_image: "default".into(),
        }
    }

    fn poll() -> PollSettings {
        PollSettings::new(Duration::from_millis(1), Duration::from_millis(200))
    }

    async fn networked(cloud: &Arc<InMemoryCloud>) -> (Reconciler, ReconciliationTable) {
        let reconciler = Reconciler::new(cloud.clone(), "demo");
        let mut table = ReconciliationTable::new();
        let settings = NetworkSettings::default();
        let poll = poll();
        NetworkTopologyBuilder::new(&reconciler, &settings, &poll)
            .build(&mut table, &StepReporter::silent())
            .await
            .unwrap();
        (reconciler, table)
    }

    #[tokio::test]
    async fn test_apply_secures_both_subnets() {
        let cloud = Arc::new(InMemoryCloud::with_settle_after(2));
        let (reconciler, mut table) = networked(&cloud).await;
        let def = definition(None);
        let poll = poll();

        SecurityManager::new(&reconciler, &def, &poll)
            .apply(&mut table, false, &StepReporter::silent())
            .await
            .unwrap();

        for subnet in [names::PUBLIC_SUBNET, names::PRIVATE_SUBNET] {
            let subnet = table.require(ResourceKind::Subnet, subnet).unwrap();
            assert!(subnet.attribute(trellis_core::domain::resource::attrs::NETWORK_ACL).is_some());
        }
        let balancer = table
            .require(ResourceKind::LoadBalancer, names::LOAD_BALANCER)
            .unwrap();
        assert_eq!(balancer.state, states::ACTIVE);
        assert_eq!(cloud.resources(ResourceKind::NetworkAcl).len(), 4);

        cloud.reset_calls();
        SecurityManager::new(&reconciler, &def, &poll)
            .apply(&mut table, false, &StepReporter::silent())
            .await
            .unwrap();
        assert!(cloud.calls().iter().all(ApiCall::is_read_only));
    }

    #[tokio::test]
    async fn test_ssh_access_resolution() {
        let cloud = Arc::new(InMemoryCloud::new());
        let (reconciler, mut table) = networked(&cloud).await;

        assert!(!resolve_ssh_access(&definition(None), &ReconciliationTable::new()));
        assert!(!resolve_ssh_access(&definition(None), &table));
        assert!(resolve_ssh_access(&definition(Some(true)), &table));

        let mut network = table.require(ResourceKind::Network, names::NETWORK).unwrap().clone();
        let mut persisted = trellis_core::domain::Tags::new();
        persisted.insert(tags::SSH_ENABLED.into(), "true".into());
        reconciler.sync_tags(&mut network, &persisted).await.unwrap();
        table.insert(network);

        assert!(resolve_ssh_access(&definition(None), &table));
        assert!(!resolve_ssh_access(&definition(Some(false)), &table));
    }
}
