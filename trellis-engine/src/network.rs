//! Network topology builder
//!
//! Ensures the cluster network in dependency order: network, public and
//! private subnets, their route tables, the internet gateway with the
//! public default route, then the NAT address and gateway with the private
//! default route. The NAT gateway is polled until it is available.

use tracing::debug;
use trellis_core::Result;
use trellis_core::domain::resource::{attrs, states};
use trellis_core::domain::{Attributes, NetworkSettings, Resource, ResourceKind};
use trellis_core::dto::Association;

use crate::names::{self, keys};
use crate::poller::{PollSettings, wait_for_state};
use crate::progress::StepReporter;
use crate::reconciler::{Reconciler, ResourceSpec};
use crate::table::ReconciliationTable;

pub struct NetworkTopologyBuilder<'a> {
    reconciler: &'a Reconciler,
    settings: &'a NetworkSettings,
    poll: &'a PollSettings,
}

impl<'a> NetworkTopologyBuilder<'a> {
    pub fn new(reconciler: &'a Reconciler, settings: &'a NetworkSettings, poll: &'a PollSettings) -> Self {
        Self {
            reconciler,
            settings,
            poll,
        }
    }

    /// Ensures the whole topology and records every handle in `table`
    pub async fn build(&self, table: &mut ReconciliationTable, reporter: &StepReporter) -> Result<()> {
        let network = self.ensure_network(table, reporter).await?;

        let public = self
            .ensure_subnet(
                table,
                reporter,
                names::PUBLIC_SUBNET,
                &self.settings.public_subnet_cidr,
                true,
                &network,
            )
            .await?;
        let private = self
            .ensure_subnet(
                table,
                reporter,
                names::PRIVATE_SUBNET,
                &self.settings.private_subnet_cidr,
                false,
                &network,
            )
            .await?;

        let public_routes = self
            .ensure_route_table(table, reporter, names::PUBLIC_ROUTES, &network)
            .await?;
        let private_routes = self
            .ensure_route_table(table, reporter, names::PRIVATE_ROUTES, &network)
            .await?;
        self.associate_route_table(table, names::PUBLIC_SUBNET, &public_routes)
            .await?;
        self.associate_route_table(table, names::PRIVATE_SUBNET, &private_routes)
            .await?;

        let gateway = self.ensure_internet_gateway(table, reporter, &network).await?;
        self.ensure_default_route(table, names::PUBLIC_ROUTES, &gateway.id)
            .await?;

        let nat = self.ensure_nat_gateway(table, reporter, &public).await?;
        self.ensure_default_route(table, names::PRIVATE_ROUTES, &nat.id)
            .await?;

        debug!(
            "Network {} ready (public {}, private {})",
            network.id, public.id, private.id
        );
        Ok(())
    }

    async fn ensure_network(&self, table: &mut ReconciliationTable, reporter: &StepReporter) -> Result<Resource> {
        announce(table, reporter, ResourceKind::Network, names::NETWORK);
        let spec = ResourceSpec::new(ResourceKind::Network, names::NETWORK)
            .defining(keys::CIDR, &self.settings.cidr)
            .attribute(keys::ENABLE_DNS_SUPPORT, "true")
            .attribute(keys::ENABLE_DNS_HOSTNAMES, "true");
        let mut network = self.reconciler.ensure(table, spec).await?;

        let mut dns = Attributes::new();
        dns.insert(keys::ENABLE_DNS_SUPPORT.to_string(), "true".to_string());
        dns.insert(keys::ENABLE_DNS_HOSTNAMES.to_string(), "true".to_string());
        if self.reconciler.sync_attributes(&mut network, &dns).await? {
            table.insert(network.clone());
        }
        Ok(network)
    }

    async fn ensure_subnet(
        &self,
        table: &mut ReconciliationTable,
        reporter: &StepReporter,
        name: &str,
        cidr: &str,
        public: bool,
        network: &Resource,
    ) -> Result<Resource> {
        announce(table, reporter, ResourceKind::Subnet, name);
        let spec = ResourceSpec::new(ResourceKind::Subnet, name)
            .defining(keys::NETWORK, &network.id)
            .defining(keys::CIDR, cidr)
            .defining(keys::PUBLIC, public.to_string());
        self.reconciler.ensure(table, spec).await
    }

    async fn ensure_route_table(
        &self,
        table: &mut ReconciliationTable,
        reporter: &StepReporter,
        name: &str,
        network: &Resource,
    ) -> Result<Resource> {
        announce(table, reporter, ResourceKind::RouteTable, name);
        let spec = ResourceSpec::new(ResourceKind::RouteTable, name).defining(keys::NETWORK, &network.id);
        self.reconciler.ensure(table, spec).await
    }

    async fn associate_route_table(
        &self,
        table: &mut ReconciliationTable,
        subnet_name: &str,
        routes: &Resource,
    ) -> Result<()> {
        let mut subnet = table.require(ResourceKind::Subnet, subnet_name)?.clone();
        if subnet.attribute(attrs::ROUTE_TABLE) == Some(routes.id.as_str()) {
            return Ok(());
        }

        debug!("Associating {} with {}", routes.label(), subnet.label());
        self.reconciler
            .api()
            .associate(&Association::RouteTable {
                route_table_id: routes.id.clone(),
                subnet_id: subnet.id.clone(),
            })
            .await?;
        subnet
            .attributes
            .insert(attrs::ROUTE_TABLE.to_string(), routes.id.clone());
        table.insert(subnet);
        Ok(())
    }

    async fn ensure_internet_gateway(
        &self,
        table: &mut ReconciliationTable,
        reporter: &StepReporter,
        network: &Resource,
    ) -> Result<Resource> {
        announce(table, reporter, ResourceKind::InternetGateway, names::INTERNET_GATEWAY);
        let spec = ResourceSpec::new(ResourceKind::InternetGateway, names::INTERNET_GATEWAY);
        let mut gateway = self.reconciler.ensure(table, spec).await?;

        if gateway.attribute(attrs::ATTACHED_NETWORK) != Some(network.id.as_str()) {
            debug!("Attaching {} to {}", gateway.label(), network.label());
            self.reconciler
                .api()
                .associate(&Association::InternetGateway {
                    gateway_id: gateway.id.clone(),
                    network_id: network.id.clone(),
                })
                .await?;
            gateway
                .attributes
                .insert(attrs::ATTACHED_NETWORK.to_string(), network.id.clone());
            table.insert(gateway.clone());
        }
        Ok(gateway)
    }

    async fn ensure_default_route(
        &self,
        table: &mut ReconciliationTable,
        routes_name: &str,
        target_id: &str,
    ) -> Result<()> {
        let mut routes = table.require(ResourceKind::RouteTable, routes_name)?.clone();
        let key = attrs::route(names::DEFAULT_ROUTE);
        if routes.attribute(&key) == Some(target_id) {
            return Ok(());
        }

        debug!("Routing {} of {} via {}", names::DEFAULT_ROUTE, routes.label(), target_id);
        self.reconciler
            .api()
            .create_route(&routes.id, names::DEFAULT_ROUTE, target_id)
            .await?;
        routes.attributes.insert(key, target_id.to_string());
        table.insert(routes);
        Ok(())
    }

    async fn ensure_nat_gateway(
        &self,
        table: &mut ReconciliationTable,
        reporter: &StepReporter,
        public: &Resource,
    ) -> Result<Resource> {
        announce(table, reporter, ResourceKind::ElasticAddress, names::NAT_ADDRESS);
        let address = self
            .reconciler
            .ensure(table, ResourceSpec::new(ResourceKind::ElasticAddress, names::NAT_ADDRESS))
            .await?;

        announce(table, reporter, ResourceKind::NatGateway, names::NAT_GATEWAY);
        let spec = ResourceSpec::new(ResourceKind::NatGateway, names::NAT_GATEWAY)
            .defining(keys::SUBNET, &public.id)
            .defining(keys::ALLOCATION, &address.id);
        let nat = self.reconciler.ensure(table, spec).await?;
        if nat.has_state(states::AVAILABLE) {
            return Ok(nat);
        }

        reporter.status("wait: nat gateway available");
        let nat = wait_for_state(
            self.reconciler.api(),
            ResourceKind::NatGateway,
            &nat.id,
            states::AVAILABLE,
            &[states::PENDING],
            self.poll,
        )
        .await?;
        table.insert(nat.clone());
        Ok(nat)
    }
}

/// Reports a creation before the reconciler makes it
fn announce(table: &ReconciliationTable, reporter: &StepReporter, kind: ResourceKind, name: &str) {
    if table.get(kind, name).is_none() {
        reporter.status(format!("create: {}", kind.as_str().replace('-', " ")));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use trellis_core::ProvisionError;
    use trellis_provider::InMemoryCloud;
    use trellis_provider::memory::ApiCall;

    use crate::progress::RecordingSink;

    fn poll() -> PollSettings {
        PollSettings::new(Duration::from_millis(1), Duration::from_millis(100))
    }

    async fn build(cloud: &Arc<InMemoryCloud>, table: &mut ReconciliationTable) -> Result<()> {
        let reconciler = Reconciler::new(cloud.clone(), "demo");
        let settings = NetworkSettings::default();
        let poll = poll();
        NetworkTopologyBuilder::new(&reconciler, &settings, &poll)
            .build(table, &StepReporter::silent())
            .await
    }

    #[tokio::test]
    async fn test_builds_wired_topology() {
        let cloud = Arc::new(InMemoryCloud::with_settle_after(3));
        let mut table = ReconciliationTable::new();
        build(&cloud, &mut table).await.unwrap();

        let network = table.require(ResourceKind::Network, names::NETWORK).unwrap();
        assert_eq!(network.attribute(keys::ENABLE_DNS_HOSTNAMES), Some("true"));

        let public = table.require(ResourceKind::Subnet, names::PUBLIC_SUBNET).unwrap();
        let public_routes = table.require(ResourceKind::RouteTable, names::PUBLIC_ROUTES).unwrap();
        let gateway = table.require(ResourceKind::InternetGateway, names::INTERNET_GATEWAY).unwrap();
        assert_eq!(public.attribute(attrs::ROUTE_TABLE), Some(public_routes.id.as_str()));
        assert_eq!(
            public_routes.attribute(&attrs::route("0.0.0.0/0")),
            Some(gateway.id.as_str())
        );
        assert_eq!(gateway.attribute(attrs::ATTACHED_NETWORK), Some(network.id.as_str()));

        let nat = table.require(ResourceKind::NatGateway, names::NAT_GATEWAY).unwrap();
        assert_eq!(nat.state, states::AVAILABLE);
        assert_eq!(nat.attribute(keys::SUBNET), Some(public.id.as_str()));
        let private_routes = table.require(ResourceKind::RouteTable, names::PRIVATE_ROUTES).unwrap();
        assert_eq!(
            private_routes.attribute(&attrs::route("0.0.0.0/0")),
            Some(nat.id.as_str())
        );

        assert_eq!(cloud.creates(), 8);
    }

    #[tokio::test]
    async fn test_rebuild_only_reads() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut table = ReconciliationTable::new();
        build(&cloud, &mut table).await.unwrap();

        let reconciler = Reconciler::new(cloud.clone(), "demo");
        let mut rediscovered = reconciler.discover_all().await.unwrap();
        assert_eq!(rediscovered, table);

        cloud.reset_calls();
        build(&cloud, &mut rediscovered).await.unwrap();
        assert!(cloud.calls().iter().all(ApiCall::is_read_only));
        assert_eq!(rediscovered, table);
    }

    #[tokio::test]
    async fn test_stuck_nat_gateway_times_out() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.stick(ResourceKind::NatGateway);
        let mut table = ReconciliationTable::new();

        let error = build(&cloud, &mut table).await.unwrap_err();
        assert!(error.is_timeout());
        assert!(table.get(ResourceKind::RouteTable, names::PRIVATE_ROUTES).is_some());
        assert_eq!(
            cloud.count(|c| matches!(c, ApiCall::CreateRoute)),
            1,
            "private default route must not be created"
        );
    }

    #[tokio::test]
    async fn test_failed_nat_gateway_is_fatal() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.stick(ResourceKind::NatGateway);
        let mut table = ReconciliationTable::new();

        let reconciler = Reconciler::new(cloud.clone(), "demo");
        let settings = NetworkSettings::default();
        let poll = PollSettings::new(Duration::from_millis(20), Duration::from_secs(5));
        let builder = NetworkTopologyBuilder::new(&reconciler, &settings, &poll);

        let watcher = {
            let cloud = cloud.clone();
            tokio::spawn(async move {
                loop {
                    if let Some(nat) = cloud.resources(ResourceKind::NatGateway).first() {
                        cloud.force_state(&nat.id, states::FAILED);
                        break;
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
        };

        let error = builder
            .build(&mut table, &StepReporter::silent())
            .await
            .unwrap_err();
        watcher.await.unwrap();
        assert!(matches!(error, ProvisionError::UnexpectedState { .. }));
    }

    #[tokio::test]
    async fn test_reports_creations() {
        let cloud = Arc::new(InMemoryCloud::new());
        let sink = Arc::new(RecordingSink::new());
        let reporter = StepReporter::new(sink.clone(), "network", false);
        let reconciler = Reconciler::new(cloud.clone(), "demo");
        let settings = NetworkSettings::default();
        let poll = poll();

        let mut table = ReconciliationTable::new();
        NetworkTopologyBuilder::new(&reconciler, &settings, &poll)
            .build(&mut table, &reporter)
            .await
            .unwrap();

        let messages: Vec<String> = sink.events().into_iter().map(|e| e.message).collect();
        assert!(messages.contains(&"create: nat gateway".to_string()));
        assert!(messages.contains(&"wait: nat gateway available".to_string()));
    }
}
