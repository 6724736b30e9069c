//! Target groups, listeners and per-node SSH access
//!
//! Every ingress rule (plus the fixed control-plane API rule) gets a target
//! group and a listener on the load balancer. Target membership is
//! reissued on every run and polled until the provider reports it. Listeners whose port is backed by neither an
//! ingress rule nor a live SSH allocation are retracted.
//!
//! With SSH access on, each node gets its own target group forwarding to
//! port 22 and a listener on its allocated SSH port. Turning SSH access off
//! retracts those listeners. The effective setting is persisted as a tag on
//! the network.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};
use trellis_core::Result;
use trellis_core::domain::resource::tags;
use trellis_core::domain::{
    Attributes, ClusterDefinition, IngressRule, IngressTarget, NodeRole, Protocol, ResourceKind, Tags,
};

use crate::names::{self, keys};
use crate::poller::{PollSettings, PollStatus, poll_until};
use crate::progress::StepReporter;
use crate::reconciler::{Reconciler, ResourceSpec};
use crate::registry::NodeRegistry;
use crate::table::ReconciliationTable;

/// Provider limit on target group names
pub const TARGET_GROUP_NAME_LIMIT: usize = 32;

const SSH_SELECTOR: &str = "ssh";
const SSH_NODE_PORT: u16 = 22;

/// Name of a target group: `{cluster}-{selector}-{protocol}-{port}`
///
/// Characters outside `[A-Za-z0-9-]` become `-`. When the name is too long
/// the cluster prefix is shortened, never the distinguishing suffix.
pub fn target_group_name(cluster: &str, selector: &str, protocol: Protocol, port: u16) -> String {
    let sanitize = |s: &str| -> String {
        s.chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
            .collect()
    };

    let suffix = format!("{}-{}-{}", sanitize(selector), protocol.as_str(), port);
    let budget = TARGET_GROUP_NAME_LIMIT.saturating_sub(suffix.len() + 1);
    let prefix: String = sanitize(cluster).chars().take(budget).collect();
    let prefix = prefix.trim_matches('-');

    if prefix.is_empty() {
        suffix
    } else {
        format!("{prefix}-{suffix}")
    }
}

/// A target group the definition asks for
#[derive(Debug, Clone, PartialEq, Eq)]
struct TargetGroupPlan {
    name: String,
    protocol: Protocol,
    port: u16,
    members: Vec<String>,
    health: Attributes,
}

/// A listener the definition asks for
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListenerPlan {
    protocol: Protocol,
    port: u16,
    target_group: String,
}

/// Counts of what a routing pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingOutcome {
    pub target_groups: usize,
    pub listeners: usize,
    pub retracted_listeners: usize,
    pub retracted_target_groups: usize,
}

pub struct RoutingManager<'a> {
    reconciler: &'a Reconciler,
    definition: &'a ClusterDefinition,
    poll: &'a PollSettings,
}

impl<'a> RoutingManager<'a> {
    pub fn new(reconciler: &'a Reconciler, definition: &'a ClusterDefinition, poll: &'a PollSettings) -> Self {
        Self {
            reconciler,
            definition,
            poll,
        }
    }

    /// Converges target groups, listeners and the SSH flag
    pub async fn apply(
        &self,
        table: &mut ReconciliationTable,
        nodes: &NodeRegistry,
        ssh_enabled: bool,
        reporter: &StepReporter,
    ) -> Result<RoutingOutcome> {
        let network_id = table.require(ResourceKind::Network, names::NETWORK)?.id.clone();
        let balancer_id = table
            .require(ResourceKind::LoadBalancer, names::LOAD_BALANCER)?
            .id
            .clone();

        let (groups, listeners) = self.plan(nodes, ssh_enabled);
        let mut outcome = RoutingOutcome::default();

        let mut group_ids = BTreeMap::new();
        for plan in &groups {
            let id = self.ensure_target_group(table, &network_id, plan, reporter).await?;
            group_ids.insert(plan.name.clone(), id);
            outcome.target_groups += 1;
        }

        let mut wanted = BTreeSet::new();
        for plan in &listeners {
            let Some(group_id) = group_ids.get(&plan.target_group) else {
                continue;
            };
            self.ensure_listener(table, &balancer_id, plan, group_id, reporter)
                .await?;
            wanted.insert(names::listener(plan.protocol, plan.port));
            outcome.listeners += 1;
        }

        outcome.retracted_listeners = self
            .retract_listeners(table, &balancer_id, &wanted, reporter)
            .await?;
        outcome.retracted_target_groups = self
            .retract_target_groups(table, &network_id, &group_ids, reporter)
            .await?;

        self.persist_ssh_flag(table, ssh_enabled).await?;
        Ok(outcome)
    }

    fn plan(&self, nodes: &NodeRegistry, ssh_enabled: bool) -> (Vec<TargetGroupPlan>, Vec<ListenerPlan>) {
        let cluster = &self.definition.name;
        let mut groups: Vec<TargetGroupPlan> = Vec::new();
        let mut listeners = Vec::new();

        let rules = std::iter::once(IngressRule::control_plane_api())
            .chain(self.definition.ingress_rules.iter().cloned());
        for rule in rules {
            let name = target_group_name(cluster, rule.target.as_str(), rule.protocol, rule.node_port);
            if !groups.iter().any(|g| g.name == name) {
                groups.push(TargetGroupPlan {
                    name: name.clone(),
                    protocol: rule.protocol,
                    port: rule.node_port,
                    members: self.members(nodes, rule.target),
                    health: health_attributes(&rule),
                });
            }
            listeners.push(ListenerPlan {
                protocol: rule.protocol,
                port: rule.external_port,
                target_group: name,
            });
        }

        if ssh_enabled {
            for node in nodes.iter().filter(|n| self.definition.node(&n.name).is_some()) {
                let (Some(port), Some(instance)) = (node.ssh_port, node.instance_id()) else {
                    continue;
                };
                let name = target_group_name(cluster, SSH_SELECTOR, Protocol::Tcp, port);
                let mut health = Attributes::new();
                health.insert(keys::HEALTH_PROTOCOL.to_string(), "tcp".to_string());
                groups.push(TargetGroupPlan {
                    name: name.clone(),
                    protocol: Protocol::Tcp,
                    port: SSH_NODE_PORT,
                    members: vec![instance.to_string()],
                    health,
                });
                listeners.push(ListenerPlan {
                    protocol: Protocol::Tcp,
                    port,
                    target_group: name,
                });
            }
        }

        (groups, listeners)
    }

    /// Instance ids receiving traffic for a selector
    ///
    /// User ingress goes to workers, or to the control plane when the
    /// cluster has no workers.
    fn members(&self, nodes: &NodeRegistry, target: IngressTarget) -> Vec<String> {
        let with_role = |role: NodeRole| -> Vec<String> {
            let mut ids: Vec<String> = nodes
                .iter()
                .filter(|node| node.role == role && self.definition.node(&node.name).is_some())
                .filter_map(|node| node.instance_id().map(str::to_string))
                .collect();
            ids.sort();
            ids
        };

        match target {
            IngressTarget::ControlPlane => with_role(NodeRole::ControlPlane),
            IngressTarget::UserIngress => {
                if self.definition.nodes_with_role(NodeRole::Worker).next().is_some() {
                    with_role(NodeRole::Worker)
                } else {
                    with_role(NodeRole::ControlPlane)
                }
            }
        }
    }

    async fn ensure_target_group(
        &self,
        table: &mut ReconciliationTable,
        network_id: &str,
        plan: &TargetGroupPlan,
        reporter: &StepReporter,
    ) -> Result<String> {
        if table.get(ResourceKind::TargetGroup, &plan.name).is_none() {
            reporter.status(format!("create: target group {}", plan.name));
        }
        let mut spec = ResourceSpec::new(ResourceKind::TargetGroup, &plan.name)
            .defining(keys::NETWORK, network_id)
            .defining(keys::PROTOCOL, plan.protocol.as_str())
            .defining(keys::PORT, plan.port.to_string());
        spec.attributes.extend(
            plan.health
                .iter()
                .filter(|(_, value)| !value.is_empty())
                .map(|(key, value)| (key.clone(), value.clone())),
        );
        let mut group = self.reconciler.ensure(table, spec).await?;

        if self.reconciler.sync_attributes(&mut group, &plan.health).await? {
            info!("Updated health check of {}", group.label());
            table.insert(group.clone());
        }

        self.reconciler
            .api()
            .set_targets(&group.id, &plan.members)
            .await?;
        self.await_registration(&group.id, &plan.members).await?;
        Ok(group.id)
    }

    /// Polls a target group until exactly `members` are registered
    async fn await_registration(&self, group_id: &str, members: &[String]) -> Result<()> {
        let api = self.reconciler.api();
        let mut wanted = members.to_vec();
        wanted.sort();
        let wanted = wanted.as_slice();

        let operation = format!("target group {group_id} to register {} target(s)", wanted.len());
        poll_until(&operation, self.poll, move || async move {
            let mut registered = api.registered_targets(group_id).await?;
            registered.sort();
            Ok(if registered == wanted {
                PollStatus::Ready(())
            } else {
                PollStatus::Waiting(format!("{} registered", registered.len()))
            })
        })
        .await
    }

    async fn ensure_listener(
        &self,
        table: &mut ReconciliationTable,
        balancer_id: &str,
        plan: &ListenerPlan,
        group_id: &str,
        reporter: &StepReporter,
    ) -> Result<()> {
        let name = names::listener(plan.protocol, plan.port);
        if table.get(ResourceKind::Listener, &name).is_none() {
            reporter.status(format!("create: listener {}/{}", plan.protocol, plan.port));
        }
        let spec = ResourceSpec::new(ResourceKind::Listener, &name)
            .defining(keys::LOAD_BALANCER, balancer_id)
            .defining(keys::PROTOCOL, plan.protocol.as_str())
            .defining(keys::PORT, plan.port.to_string())
            .attribute(keys::TARGET_GROUP, group_id);
        let mut listener = self.reconciler.ensure(table, spec).await?;

        let mut forward = Attributes::new();
        forward.insert(keys::TARGET_GROUP.to_string(), group_id.to_string());
        if self.reconciler.sync_attributes(&mut listener, &forward).await? {
            info!("Repointed {} to target group {}", listener.label(), group_id);
            table.insert(listener);
        }
        Ok(())
    }

    /// Deletes listeners on the balancer that no rule or SSH allocation backs
    async fn retract_listeners(
        &self,
        table: &mut ReconciliationTable,
        balancer_id: &str,
        wanted: &BTreeSet<String>,
        reporter: &StepReporter,
    ) -> Result<usize> {
        let stale: Vec<String> = table
            .of_kind(ResourceKind::Listener)
            .filter(|listener| listener.attribute(keys::LOAD_BALANCER) == Some(balancer_id))
            .filter_map(|listener| listener.logical_name().map(str::to_string))
            .filter(|name| !wanted.contains(name))
            .collect();

        for name in &stale {
            reporter.status(format!("retract: {name}"));
            self.reconciler
                .retire(table, ResourceKind::Listener, name)
                .await?;
        }
        Ok(stale.len())
    }

    /// Deletes cluster target groups that are no longer planned
    async fn retract_target_groups(
        &self,
        table: &mut ReconciliationTable,
        network_id: &str,
        planned: &BTreeMap<String, String>,
        reporter: &StepReporter,
    ) -> Result<usize> {
        let still_referenced: BTreeSet<String> = table
            .of_kind(ResourceKind::Listener)
            .filter_map(|listener| listener.attribute(keys::TARGET_GROUP).map(str::to_string))
            .collect();

        let stale: Vec<(String, String)> = table
            .of_kind(ResourceKind::TargetGroup)
            .filter(|group| group.attribute(keys::NETWORK) == Some(network_id))
            .filter_map(|group| Some((group.logical_name()?.to_string(), group.id.clone())))
            .filter(|(name, _)| !planned.contains_key(name))
            .collect();

        let mut retracted = 0;
        for (name, id) in stale {
            if still_referenced.contains(&id) {
                warn!("Keeping target group {} that a foreign listener still uses", name);
                continue;
            }
            reporter.status(format!("retract: target group {name}"));
            self.reconciler
                .retire(table, ResourceKind::TargetGroup, &name)
                .await?;
            retracted += 1;
        }
        Ok(retracted)
    }

    async fn persist_ssh_flag(&self, table: &mut ReconciliationTable, ssh_enabled: bool) -> Result<()> {
        let mut network = table.require(ResourceKind::Network, names::NETWORK)?.clone();
        let mut flag = Tags::new();
        flag.insert(tags::SSH_ENABLED.to_string(), ssh_enabled.to_string());
        if self.reconciler.sync_tags(&mut network, &flag).await? {
            info!("SSH access {}", if ssh_enabled { "enabled" } else { "disabled" });
            table.insert(network);
        }
        Ok(())
    }
}

fn health_attributes(rule: &IngressRule) -> Attributes {
    let check = rule.effective_health_check();
    let mut attributes = Attributes::new();
    attributes.insert(keys::HEALTH_PROTOCOL.to_string(), check.protocol.as_str().to_string());
    attributes.insert(
        keys::HEALTH_PORT.to_string(),
        check.port.unwrap_or(rule.node_port).to_string(),
    );
    attributes.insert(keys::HEALTH_PATH.to_string(), check.path.unwrap_or_default());
    attributes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use trellis_core::domain::{
        NetworkSettings, NodeDefinition, NodeRecord, PortRange, Resource,
    };
    use trellis_core::ProvisionError;
    use trellis_core::dto::CreateResource;
    use trellis_provider::memory::ApiCall;
    use trellis_provider::{CloudApi, InMemoryCloud};

    use crate::network::NetworkTopologyBuilder;
    use crate::security::SecurityManager;

    const POLL: PollSettings = PollSettings {
        interval: Duration::from_millis(1),
        timeout: Duration::from_millis(200),
        max_transient_errors: 5,
        max_backoff: Duration::from_millis(10),
    };

    fn node(name: &str, role: NodeRole) -> NodeDefinition {
        NodeDefinition {
            name: name.into(),
            role,
            instance_type: "m5.large".into(),
            data_volume_gb: 100,
            partition: None,
            ssh_port: None,
        }
    }

    fn definition(nodes: Vec<NodeDefinition>, rules: Vec<IngressRule>) -> ClusterDefinition {
        ClusterDefinition {
            name: "demo".into(),
            nodes,
            ingress_rules: rules,
            ssh_port_range: PortRange::new(2222, 2232),
            ssh_access: None,
            control_plane_partitions: 1,
            worker_partitions: 1,
            network: NetworkSettings::default(),
            admin_account: "trellis".into(),
            image_account: "admin".into(),
            machine_image: "default".into(),
        }
    }

    fn http_rule() -> IngressRule {
        IngressRule {
            protocol: Protocol::Tcp,
            external_port: 80,
            node_port: 30080,
            target: IngressTarget::UserIngress,
            source_cidrs: vec![],
            destination_cidrs: vec![],
            health_check: None,
        }
    }

    async fn fixture(
        def: &ClusterDefinition,
    ) -> (Arc<InMemoryCloud>, Reconciler, ReconciliationTable, NodeRegistry) {
        fixture_on(InMemoryCloud::new(), def).await
    }

    async fn fixture_on(
        cloud: InMemoryCloud,
        def: &ClusterDefinition,
    ) -> (Arc<InMemoryCloud>, Reconciler, ReconciliationTable, NodeRegistry) {
        let cloud = Arc::new(cloud);
        let reconciler = Reconciler::new(cloud.clone(), def.name.clone());
        let poll = POLL;
        let mut table = ReconciliationTable::new();
        NetworkTopologyBuilder::new(&reconciler, &def.network, &poll)
            .build(&mut table, &StepReporter::silent())
            .await
            .unwrap();
        SecurityManager::new(&reconciler, def, &poll)
            .apply(&mut table, false, &StepReporter::silent())
            .await
            .unwrap();

        let mut nodes = NodeRegistry::new();
        for (index, declared) in def.nodes.iter().enumerate() {
            let instance = cloud
                .create(CreateResource {
                    kind: ResourceKind::Instance,
                    attributes: Attributes::new(),
                    tags: Tags::new(),
                })
                .await
                .unwrap();
            let mut record = NodeRecord::absent(&declared.name, declared.role);
            record.instance = Some(instance);
            record.ssh_port = Some(2222 + index as u16);
            nodes.upsert(record);
        }
        (cloud, reconciler, table, nodes)
    }

    fn listener_ports(table: &ReconciliationTable) -> BTreeSet<u16> {
        table
            .of_kind(ResourceKind::Listener)
            .filter_map(|l| l.attribute(keys::PORT)?.parse().ok())
            .collect()
    }

    #[test]
    fn test_target_group_names() {
        assert_eq!(
            target_group_name("prod", "user-ingress", Protocol::Tcp, 30443),
            "prod-user-ingress-tcp-30443"
        );

        let long = target_group_name("a-really-long-cluster-name", "control-plane", Protocol::Tcp, 6443);
        assert!(long.len() <= TARGET_GROUP_NAME_LIMIT);
        assert!(long.ends_with("-control-plane-tcp-6443"));
        assert!(long.starts_with("a-real"));

        let odd = target_group_name("my_cluster.v2", "ssh", Protocol::Tcp, 2222);
        assert_eq!(odd, "my-cluster-v2-ssh-tcp-2222");
    }

    #[tokio::test]
    async fn test_routing_registers_targets_and_listeners() {
        let def = definition(
            vec![
                node("cp1", NodeRole::ControlPlane),
                node("w1", NodeRole::Worker),
                node("w2", NodeRole::Worker),
            ],
            vec![http_rule()],
        );
        let (cloud, reconciler, mut table, nodes) = fixture(&def).await;

        let outcome = RoutingManager::new(&reconciler, &def, &POLL)
            .apply(&mut table, &nodes, false, &StepReporter::silent())
            .await
            .unwrap();
        assert_eq!(outcome.target_groups, 2);
        assert_eq!(outcome.listeners, 2);
        assert_eq!(listener_ports(&table), BTreeSet::from([80, 6443]));

        let ingress = table
            .require(ResourceKind::TargetGroup, "demo-user-ingress-tcp-30080")
            .unwrap();
        let mut workers: Vec<String> = ["w1", "w2"]
            .iter()
            .map(|n| nodes.get(n).unwrap().instance_id().unwrap().to_string())
            .collect();
        workers.sort();
        assert_eq!(cloud.peek_targets(&ingress.id), workers);

        let api = table
            .require(ResourceKind::TargetGroup, "demo-control-plane-tcp-6443")
            .unwrap();
        assert_eq!(api.attribute(keys::HEALTH_PATH), Some("/readyz"));
        assert_eq!(
            cloud.peek_targets(&api.id),
            vec![nodes.get("cp1").unwrap().instance_id().unwrap().to_string()]
        );

        let network = table.require(ResourceKind::Network, names::NETWORK).unwrap();
        assert_eq!(network.tag(tags::SSH_ENABLED), Some("false"));
    }

    #[tokio::test]
    async fn test_routing_waits_for_targets_to_register() {
        let def = definition(
            vec![node("cp1", NodeRole::ControlPlane), node("w1", NodeRole::Worker)],
            vec![http_rule()],
        );
        let (cloud, reconciler, mut table, nodes) =
            fixture_on(InMemoryCloud::with_settle_after(3), &def).await;
        cloud.reset_calls();

        RoutingManager::new(&reconciler, &def, &POLL)
            .apply(&mut table, &nodes, false, &StepReporter::silent())
            .await
            .unwrap();

        assert_eq!(cloud.count(|c| *c == ApiCall::SetTargets), 2);
        assert_eq!(cloud.count(|c| *c == ApiCall::RegisteredTargets), 6);
        let ingress = table
            .require(ResourceKind::TargetGroup, "demo-user-ingress-tcp-30080")
            .unwrap();
        assert_eq!(
            cloud.peek_targets(&ingress.id),
            vec![nodes.get("w1").unwrap().instance_id().unwrap().to_string()]
        );
    }

    #[tokio::test]
    async fn test_unregistered_targets_time_out() {
        let def = definition(vec![node("cp1", NodeRole::ControlPlane)], vec![]);
        let (cloud, reconciler, mut table, nodes) = fixture(&def).await;
        cloud.stick(ResourceKind::TargetGroup);

        let err = RoutingManager::new(&reconciler, &def, &POLL)
            .apply(&mut table, &nodes, false, &StepReporter::silent())
            .await
            .unwrap_err();
        assert!(matches!(err, ProvisionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_rerun_reissues_only_target_registration() {
        let def = definition(vec![node("cp1", NodeRole::ControlPlane)], vec![http_rule()]);
        let (cloud, reconciler, mut table, nodes) = fixture(&def).await;
        let routing = RoutingManager::new(&reconciler, &def, &POLL);
        routing
            .apply(&mut table, &nodes, true, &StepReporter::silent())
            .await
            .unwrap();

        cloud.reset_calls();
        let outcome = routing
            .apply(&mut table, &nodes, true, &StepReporter::silent())
            .await
            .unwrap();
        assert_eq!(outcome.retracted_listeners, 0);
        assert!(
            cloud
                .calls()
                .iter()
                .all(|c| c.is_read_only() || *c == ApiCall::SetTargets)
        );
        assert_eq!(cloud.count(|c| *c == ApiCall::SetTargets), 3);
    }

    #[tokio::test]
    async fn test_user_ingress_falls_back_to_control_plane() {
        let def = definition(vec![node("cp1", NodeRole::ControlPlane)], vec![http_rule()]);
        let (cloud, reconciler, mut table, nodes) = fixture(&def).await;

        RoutingManager::new(&reconciler, &def, &POLL)
            .apply(&mut table, &nodes, false, &StepReporter::silent())
            .await
            .unwrap();

        let ingress = table
            .require(ResourceKind::TargetGroup, "demo-user-ingress-tcp-30080")
            .unwrap();
        assert_eq!(
            cloud.peek_targets(&ingress.id),
            vec![nodes.get("cp1").unwrap().instance_id().unwrap().to_string()]
        );
    }

    #[tokio::test]
    async fn test_unbacked_listener_is_retracted() {
        let def = definition(vec![node("cp1", NodeRole::ControlPlane)], vec![http_rule()]);
        let (cloud, reconciler, mut table, nodes) = fixture(&def).await;
        let balancer = table
            .require(ResourceKind::LoadBalancer, names::LOAD_BALANCER)
            .unwrap()
            .clone();

        // A listener on 9999 left behind by an earlier definition
        let stale = reconciler
            .ensure(
                &mut table,
                ResourceSpec::new(ResourceKind::Listener, names::listener(Protocol::Tcp, 9999))
                    .defining(keys::LOAD_BALANCER, &balancer.id)
                    .defining(keys::PROTOCOL, "tcp")
                    .defining(keys::PORT, "9999"),
            )
            .await
            .unwrap();

        let outcome = RoutingManager::new(&reconciler, &def, &POLL)
            .apply(&mut table, &nodes, false, &StepReporter::silent())
            .await
            .unwrap();

        assert_eq!(outcome.retracted_listeners, 1);
        assert!(cloud.resource(&stale.id).is_none());
        assert!(!listener_ports(&table).contains(&9999));
        assert!(listener_ports(&table).contains(&80));
    }

    #[tokio::test]
    async fn test_ssh_toggle_adds_and_retracts_node_listeners() {
        let def = definition(
            vec![node("cp1", NodeRole::ControlPlane), node("w1", NodeRole::Worker)],
            vec![],
        );
        let (cloud, reconciler, mut table, nodes) = fixture(&def).await;
        let routing = RoutingManager::new(&reconciler, &def, &POLL);

        routing
            .apply(&mut table, &nodes, true, &StepReporter::silent())
            .await
            .unwrap();
        assert_eq!(listener_ports(&table), BTreeSet::from([2222, 2223, 6443]));
        let ssh_group = table
            .require(ResourceKind::TargetGroup, "demo-ssh-tcp-2223")
            .unwrap()
            .clone();
        assert_eq!(ssh_group.attribute(keys::PORT), Some("22"));
        assert_eq!(
            cloud.peek_targets(&ssh_group.id),
            vec![nodes.get("w1").unwrap().instance_id().unwrap().to_string()]
        );
        assert_eq!(
            table
                .require(ResourceKind::Network, names::NETWORK)
                .unwrap()
                .tag(tags::SSH_ENABLED),
            Some("true")
        );

        let outcome = routing
            .apply(&mut table, &nodes, false, &StepReporter::silent())
            .await
            .unwrap();
        assert_eq!(outcome.retracted_listeners, 2);
        assert_eq!(outcome.retracted_target_groups, 2);
        assert_eq!(listener_ports(&table), BTreeSet::from([6443]));
        assert!(cloud.resource(&ssh_group.id).is_none());
        assert_eq!(
            table
                .require(ResourceKind::Network, names::NETWORK)
                .unwrap()
                .tag(tags::SSH_ENABLED),
            Some("false")
        );
    }

    #[tokio::test]
    async fn test_changed_target_group_repoints_listener() {
        let mut rule = http_rule();
        let def = definition(vec![node("cp1", NodeRole::ControlPlane)], vec![rule.clone()]);
        let (cloud, reconciler, mut table, nodes) = fixture(&def).await;
        RoutingManager::new(&reconciler, &def, &POLL)
            .apply(&mut table, &nodes, false, &StepReporter::silent())
            .await
            .unwrap();

        rule.node_port = 30081;
        let def = definition(vec![node("cp1", NodeRole::ControlPlane)], vec![rule]);
        RoutingManager::new(&reconciler, &def, &POLL)
            .apply(&mut table, &nodes, false, &StepReporter::silent())
            .await
            .unwrap();

        let listener: &Resource = table
            .require(ResourceKind::Listener, &names::listener(Protocol::Tcp, 80))
            .unwrap();
        let group = table
            .require(ResourceKind::TargetGroup, "demo-user-ingress-tcp-30081")
            .unwrap();
        assert_eq!(listener.attribute(keys::TARGET_GROUP), Some(group.id.as_str()));
        assert!(
            table
                .get(ResourceKind::TargetGroup, "demo-user-ingress-tcp-30080")
                .is_none()
        );
        assert_eq!(cloud.resources(ResourceKind::Listener).len(), 2);
    }
}
