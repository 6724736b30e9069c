//! Network ACL synthesis and swap
//!
//! Each subnet owns two ACLs, slot `a` and slot `b`. Exactly one is
//! associated at a time. A rule change is written in full to the inactive
//! ACL, which is then associated in a single provider call; the subnet is
//! never left without an ACL or with a half-written one. The previously
//! active ACL is left untouched and becomes the target of the next change.

use std::collections::BTreeSet;

use tracing::{debug, info};
use trellis_core::Result;
use trellis_core::domain::resource::attrs;
use trellis_core::domain::{ClusterDefinition, IngressRule, Protocol, Resource, ResourceKind};
use trellis_core::dto::{AclEntry, AclProtocol, Association};

use crate::names::{self, keys};
use crate::poller::{PollSettings, PollStatus, poll_until};
use crate::progress::StepReporter;
use crate::reconciler::{Reconciler, ResourceSpec};
use crate::table::ReconciliationTable;

const FIRST_RULE: u16 = 100;
const RULE_STEP: u16 = 10;
const EPHEMERAL_PORTS: (u16, u16) = (1024, u16::MAX);
const SSH_PORT: u16 = 22;
const ANYWHERE: &str = "0.0.0.0/0";

/// Which side of the network a subnet is on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubnetRole {
    /// Hosts the load balancer and NAT gateway
    Public,
    /// Hosts the nodes
    Private,
}

impl SubnetRole {
    pub fn logical_name(&self) -> &'static str {
        match self {
            SubnetRole::Public => names::PUBLIC_SUBNET,
            SubnetRole::Private => names::PRIVATE_SUBNET,
        }
    }
}

/// Derives the complete entry list of a subnet's ACL
///
/// The public subnet admits external listener ports and the SSH range; the
/// private subnet admits node ports and port 22. Both admit all traffic from
/// inside the network and return traffic on ephemeral ports.
pub fn subnet_rules(definition: &ClusterDefinition, role: SubnetRole, ssh_enabled: bool) -> Vec<AclEntry> {
    let network = &definition.network;
    let subnet_cidr = match role {
        SubnetRole::Public => &network.public_subnet_cidr,
        SubnetRole::Private => &network.private_subnet_cidr,
    };

    let mut numbers = (0..).map(|i| FIRST_RULE + i * RULE_STEP);
    let mut next = move || numbers.next().unwrap_or(u16::MAX);
    let mut entries = vec![AclEntry::allow_inbound(
        next(),
        AclProtocol::All,
        0,
        u16::MAX,
        network.cidr.clone(),
    )];

    let mut seen = BTreeSet::new();
    let rules = std::iter::once(IngressRule::control_plane_api())
        .chain(definition.ingress_rules.iter().cloned());
    for rule in rules.filter(|rule| rule.applies_to_subnet(subnet_cidr)) {
        let port = match role {
            SubnetRole::Public => rule.external_port,
            SubnetRole::Private => rule.node_port,
        };
        for source in rule.sources() {
            if seen.insert((rule.protocol, port, source.clone())) {
                entries.push(AclEntry::allow_inbound(
                    next(),
                    acl_protocol(rule.protocol),
                    port,
                    port,
                    source,
                ));
            }
        }
    }

    if ssh_enabled {
        let (from, to) = match role {
            SubnetRole::Public => (definition.ssh_port_range.start, definition.ssh_port_range.end),
            SubnetRole::Private => (SSH_PORT, SSH_PORT),
        };
        entries.push(AclEntry::allow_inbound(next(), AclProtocol::Tcp, from, to, ANYWHERE));
    }

    for protocol in [AclProtocol::Tcp, AclProtocol::Udp] {
        entries.push(AclEntry::allow_inbound(
            next(),
            protocol,
            EPHEMERAL_PORTS.0,
            EPHEMERAL_PORTS.1,
            ANYWHERE,
        ));
    }

    entries.push(AclEntry::allow_all_outbound(FIRST_RULE));
    entries
}

fn acl_protocol(protocol: Protocol) -> AclProtocol {
    match protocol {
        Protocol::Tcp => AclProtocol::Tcp,
        Protocol::Udp => AclProtocol::Udp,
    }
}

/// Result of applying a rule set to a subnet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AclOutcome {
    /// The active ACL already carries the rule set
    Unchanged,
    /// The rule set was written to `to` and `to` is now associated
    Swapped { from: Option<String>, to: String },
}

/// Applies rule sets through the two-slot swap
pub struct AclSwapper<'a> {
    reconciler: &'a Reconciler,
    poll: &'a PollSettings,
}

impl<'a> AclSwapper<'a> {
    pub fn new(reconciler: &'a Reconciler, poll: &'a PollSettings) -> Self {
        Self { reconciler, poll }
    }

    /// Makes `desired` the effective rule set of the subnet
    pub async fn apply(
        &self,
        table: &mut ReconciliationTable,
        subnet_name: &str,
        desired: Vec<AclEntry>,
        reporter: &StepReporter,
    ) -> Result<AclOutcome> {
        let subnet = table.require(ResourceKind::Subnet, subnet_name)?.clone();
        let network_id = table.require(ResourceKind::Network, names::NETWORK)?.id.clone();

        let mut slots = Vec::with_capacity(2);
        for slot in ['a', 'b'] {
            let name = names::acl(subnet_name, slot);
            if table.get(ResourceKind::NetworkAcl, &name).is_none() {
                reporter.status(format!("create: network acl {slot} for {subnet_name}"));
            }
            let spec = ResourceSpec::new(ResourceKind::NetworkAcl, name)
                .defining(keys::NETWORK, &network_id)
                .defining(keys::SUBNET, &subnet.id);
            slots.push(self.reconciler.ensure(table, spec).await?);
        }

        let api = self.reconciler.api();
        let active_id = subnet.attribute(attrs::NETWORK_ACL).map(str::to_string);
        let active = slots
            .iter()
            .position(|acl| Some(acl.id.as_str()) == active_id.as_deref());

        let desired = sorted(desired);
        if let Some(index) = active {
            let current = sorted(api.acl_entries(&slots[index].id).await?);
            if current == desired {
                debug!("{} already carries the desired ACL", subnet.label());
                return Ok(AclOutcome::Unchanged);
            }
        }

        let target: &Resource = match active {
            Some(index) => &slots[1 - index],
            None => &slots[0],
        };

        info!(
            "Swapping ACL of {} to {} ({} entries)",
            subnet.label(),
            target.label(),
            desired.len()
        );
        reporter.status(format!("acl: swapping {subnet_name}"));
        api.replace_acl_entries(&target.id, &desired).await?;
        api.associate(&Association::NetworkAcl {
            acl_id: target.id.clone(),
            subnet_id: subnet.id.clone(),
        })
        .await?;

        let confirmed = self.confirm_association(&subnet.id, &target.id).await?;
        table.insert(confirmed);

        Ok(AclOutcome::Swapped {
            from: active_id,
            to: target.id.clone(),
        })
    }

    /// Polls the subnet until it reports the new ACL
    async fn confirm_association(&self, subnet_id: &str, acl_id: &str) -> Result<Resource> {
        let api = self.reconciler.api();
        let operation = format!("subnet {subnet_id} to use acl {acl_id}");
        poll_until(&operation, self.poll, move || async move {
            let subnet = api.describe(ResourceKind::Subnet, subnet_id).await?;
            Ok(match subnet.attribute(attrs::NETWORK_ACL) {
                Some(current) if current == acl_id => PollStatus::Ready(subnet),
                current => PollStatus::Waiting(current.unwrap_or("none").to_string()),
            })
        })
        .await
    }
}

fn sorted(mut entries: Vec<AclEntry>) -> Vec<AclEntry> {
    entries.sort();
    entries
}
