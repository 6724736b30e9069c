//! Hosting managers
//!
//! A hosting manager is the capability set the pipeline drives. Every
//! provider backend implements the same trait, so the pipeline and its
//! steps are written once.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};
use trellis_core::domain::resource::tags;
use trellis_core::domain::{ClusterDefinition, NodeRecord, ResourceKind};
use trellis_core::{ProvisionError, Result};
use trellis_provider::CloudApi;

use crate::config::EngineConfig;
use crate::instance::{DataDisk, InstanceController, NodePlacement};
use crate::network::NetworkTopologyBuilder;
use crate::placement::PlacementPlanner;
use crate::poller::PollSettings;
use crate::progress::StepReporter;
use crate::reconciler::Reconciler;
use crate::registry::NodeRegistry;
use crate::security::SecurityManager;
use crate::security::routing::{RoutingManager, RoutingOutcome};
use crate::table::ReconciliationTable;

/// Worker pool size of providers that tolerate concurrent instance work
pub const DEFAULT_PARALLELISM: usize = 4;

/// What a discovery pass found
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub table: ReconciliationTable,
    pub nodes: NodeRegistry,
}

/// State shared by the global steps of a run
///
/// Only the control loop holds it mutably.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub definition: Arc<ClusterDefinition>,
    pub table: ReconciliationTable,
    pub nodes: NodeRegistry,
    pub ssh_enabled: bool,
}

/// Read-only view handed to per-node workers
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub definition: Arc<ClusterDefinition>,
    pub table: Arc<ReconciliationTable>,
}

impl RunContext {
    /// Snapshot of the shared state for per-node workers
    pub fn node_context(&self) -> NodeContext {
        NodeContext {
            definition: Arc::clone(&self.definition),
            table: Arc::new(self.table.clone()),
        }
    }
}

#[async_trait]
pub trait HostingManager: Send + Sync {
    /// Name of the provider backend, for logs
    fn provider(&self) -> &str;

    /// Worker pool size used when the configuration sets none
    fn default_parallelism(&self) -> usize;

    /// Rejects definitions this manager cannot provision
    fn validate(&self, definition: &ClusterDefinition) -> Result<()>;

    /// Rebuilds the reconciliation table and node records from provider tags
    async fn discover(&self, definition: &ClusterDefinition) -> Result<Discovery>;

    async fn provision_network(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<()>;

    async fn provision_security(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<()>;

    /// Deprovisions nodes that are no longer declared; returns how many
    async fn prune_nodes(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<usize>;

    /// Places every declared node and ensures the placement groups
    async fn assign_placement(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<()>;

    /// Drives one node's instance to ready
    async fn provision_node(
        &self,
        node: NodeContext,
        record: NodeRecord,
        reporter: &StepReporter,
    ) -> Result<NodeRecord>;

    async fn data_disk(
        &self,
        node: NodeContext,
        record: &NodeRecord,
        reporter: &StepReporter,
    ) -> Result<DataDisk>;

    /// Converges target groups, listeners and SSH access
    async fn manage_routing(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<RoutingOutcome>;
}

/// Hosting manager for any provider reachable through [`CloudApi`]
pub struct CloudHostingManager {
    provider: String,
    reconciler: Reconciler,
    poll: PollSettings,
    parallelism: usize,
}

impl CloudHostingManager {
    pub fn new(
        provider: impl Into<String>,
        api: Arc<dyn CloudApi>,
        cluster: impl Into<String>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            provider: provider.into(),
            reconciler: Reconciler::new(api, cluster),
            poll: config.poll_settings(),
            parallelism: DEFAULT_PARALLELISM,
        }
    }

    /// Overrides the default worker pool size, e.g. 1 for single-host providers
    pub fn with_default_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }
}

#[async_trait]
impl HostingManager for CloudHostingManager {
    fn provider(&self) -> &str {
        &self.provider
    }

    fn default_parallelism(&self) -> usize {
        self.parallelism
    }

    fn validate(&self, definition: &ClusterDefinition) -> Result<()> {
        definition.validate()?;
        if definition.name != self.reconciler.cluster() {
            return Err(ProvisionError::Validation(format!(
                "definition is for cluster '{}' but the manager serves '{}'",
                definition.name,
                self.reconciler.cluster()
            )));
        }
        Ok(())
    }

    async fn discover(&self, _definition: &ClusterDefinition) -> Result<Discovery> {
        let table = self.reconciler.discover_all().await?;

        let mut nodes = NodeRegistry::new();
        for instance in table.of_kind(ResourceKind::Instance) {
            let Some(mut record) = NodeRecord::from_instance(instance.clone()) else {
                warn!("Instance {} has no node tags, ignoring it", instance.label());
                continue;
            };
            record.volumes = table
                .of_kind(ResourceKind::Volume)
                .filter(|volume| volume.tag(tags::NODE) == Some(record.name.as_str()))
                .cloned()
                .collect();
            record.volumes.sort_by(|a, b| a.id.cmp(&b.id));
            nodes.upsert(record);
        }

        info!(
            "Discovered {} resource(s) and {} node(s) on {}",
            table.len(),
            nodes.len(),
            self.provider
        );
        Ok(Discovery { table, nodes })
    }

    async fn provision_network(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<()> {
        NetworkTopologyBuilder::new(&self.reconciler, &run.definition.network, &self.poll)
            .build(&mut run.table, reporter)
            .await
    }

    async fn provision_security(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<()> {
        SecurityManager::new(&self.reconciler, &run.definition, &self.poll)
            .apply(&mut run.table, run.ssh_enabled, reporter)
            .await
    }

    async fn prune_nodes(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<usize> {
        let stale: Vec<NodeRecord> = run
            .nodes
            .iter()
            .filter(|record| run.definition.node(&record.name).is_none())
            .cloned()
            .collect();

        let controller = InstanceController::new(&self.reconciler, &run.definition, &self.poll);
        for record in &stale {
            reporter.for_node(&record.name).status("delete: virtual machine");
            controller.deprovision(&mut run.table, record).await?;
            run.nodes.remove(&record.name);
        }
        if !stale.is_empty() {
            info!("Pruned {} undeclared node(s)", stale.len());
        }
        Ok(stale.len())
    }

    async fn assign_placement(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<()> {
        PlacementPlanner::new(&self.reconciler, &run.definition)
            .apply(&mut run.table, &mut run.nodes, reporter)
            .await
    }

    async fn provision_node(
        &self,
        node: NodeContext,
        record: NodeRecord,
        reporter: &StepReporter,
    ) -> Result<NodeRecord> {
        let placement = NodePlacement::resolve(&node.table, record.role)?;
        InstanceController::new(&self.reconciler, &node.definition, &self.poll)
            .reconcile(record, &placement, reporter)
            .await
    }

    async fn data_disk(
        &self,
        node: NodeContext,
        record: &NodeRecord,
        reporter: &StepReporter,
    ) -> Result<DataDisk> {
        reporter.status("data-disk: checking");
        InstanceController::new(&self.reconciler, &node.definition, &self.poll)
            .data_disk(record)
            .await
    }

    async fn manage_routing(&self, run: &mut RunContext, reporter: &StepReporter) -> Result<RoutingOutcome> {
        RoutingManager::new(&self.reconciler, &run.definition, &self.poll)
            .apply(&mut run.table, &run.nodes, run.ssh_enabled, reporter)
            .await
    }
}
