//! Provisioning pipeline
//!
//! ```text
//! Idle -> Discovering -> Running(step) -> Succeeded | Failed
//! ```
//!
//! Discovery rebuilds the reconciliation table from provider tags before any
//! mutating step. Global steps run once, in order, on the control loop.
//! Per-node steps fan out over a bounded worker pool; each worker gets a
//! snapshot of the table and its own node record, and the control loop folds
//! the returned records back in once the step has drained. The first failure
//! stops further admissions, lets running workers finish, and fails the run.
//! Nothing is rolled back: every step is safe to rerun.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info};
use trellis_core::domain::{ClusterDefinition, NodePhase, NodeRecord, NodeRole};
use trellis_core::{ProvisionError, Result};

use crate::config::EngineConfig;
use crate::error::PipelineError;
use crate::hosting::{HostingManager, NodeContext, RunContext};
use crate::progress::{ProgressSink, StepReporter};
use crate::registry::NodeRegistry;
use crate::security::resolve_ssh_access;
use crate::security::routing::RoutingOutcome;
use crate::table::ReconciliationTable;

/// Where a run currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    Discovering,
    /// Executing the step at this index
    Running(usize),
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepKind {
    /// Runs once on the control loop
    Global,
    /// Runs once per declared node on the worker pool
    PerNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepAction {
    Network,
    Security,
    Prune,
    Placement,
    Instances,
    DataDisk,
    Routing,
}

/// One step of the pipeline
#[derive(Debug, Clone)]
pub struct ProvisioningStep {
    pub name: &'static str,
    pub kind: StepKind,
    /// Upper bound on concurrent workers for this step
    pub parallelism: Option<usize>,
    /// Runs and fails like any other step but reports no progress
    pub quiet: bool,
    action: StepAction,
}

impl ProvisioningStep {
    fn global(name: &'static str, action: StepAction) -> Self {
        Self {
            name,
            kind: StepKind::Global,
            parallelism: None,
            quiet: false,
            action,
        }
    }

    fn per_node(name: &'static str, action: StepAction) -> Self {
        Self {
            kind: StepKind::PerNode,
            ..Self::global(name, action)
        }
    }

    fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }
}

/// The steps of a provisioning run, in order
pub fn standard_steps() -> Vec<ProvisioningStep> {
    vec![
        ProvisioningStep::global("network", StepAction::Network),
        ProvisioningStep::global("security", StepAction::Security),
        ProvisioningStep::global("prune", StepAction::Prune),
        ProvisioningStep::global("placement", StepAction::Placement),
        ProvisioningStep::per_node("instances", StepAction::Instances),
        ProvisioningStep::per_node("data-disk", StepAction::DataDisk).quiet(),
        ProvisioningStep::global("routing", StepAction::Routing),
    ]
}

/// Final state of one node after a successful run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeSummary {
    pub name: String,
    pub role: NodeRole,
    pub phase: NodePhase,
    pub instance_id: Option<String>,
    pub ssh_port: Option<u16>,
    pub partition: Option<u32>,
}

/// What a successful run did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub cluster: String,
    /// Resources found by discovery
    pub discovered: usize,
    /// Resources in the table that discovery did not find
    pub created: usize,
    /// Resources in the table at the end of the run
    pub resources: usize,
    pub pruned: usize,
    pub ssh_enabled: bool,
    pub nodes: Vec<NodeSummary>,
    #[serde(skip)]
    pub routing: RoutingOutcome,
}

type StepFailure = (Option<String>, ProvisionError);

pub struct Pipeline {
    manager: Arc<dyn HostingManager>,
    definition: Arc<ClusterDefinition>,
    config: EngineConfig,
    sink: Arc<dyn ProgressSink>,
    steps: Vec<ProvisioningStep>,
    state: PipelineState,
    context: Option<RunContext>,
}

impl Pipeline {
    pub fn new(
        manager: Arc<dyn HostingManager>,
        definition: ClusterDefinition,
        config: EngineConfig,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            manager,
            definition: Arc::new(definition),
            config,
            sink,
            steps: standard_steps(),
            state: PipelineState::Idle,
            context: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn steps(&self) -> &[ProvisioningStep] {
        &self.steps
    }

    /// Reconciliation table of the last run, if it got past discovery
    pub fn table(&self) -> Option<&ReconciliationTable> {
        self.context.as_ref().map(|run| &run.table)
    }

    /// Node records of the last run, if it got past discovery
    pub fn nodes(&self) -> Option<&NodeRegistry> {
        self.context.as_ref().map(|run| &run.nodes)
    }

    /// Worker pool size for a per-node step
    fn parallelism(&self, step: &ProvisioningStep) -> usize {
        let limit = self
            .config
            .max_parallel
            .unwrap_or_else(|| self.manager.default_parallelism());
        step.parallelism
            .map_or(limit, |hint| limit.min(hint))
            .max(1)
    }

    /// Runs discovery and every step, stopping at the first failure
    pub async fn run(&mut self) -> std::result::Result<RunSummary, PipelineError> {
        self.state = PipelineState::Idle;
        self.context = None;
        info!(
            "Provisioning cluster {} on {} ({} node(s))",
            self.definition.name,
            self.manager.provider(),
            self.definition.nodes.len()
        );

        let validation = self
            .config
            .validate()
            .and_then(|()| self.manager.validate(&self.definition));
        if let Err(e) = validation {
            return Err(self.fail("validate", None, e, None));
        }

        self.state = PipelineState::Discovering;
        let reporter = StepReporter::new(Arc::clone(&self.sink), "discover", false);
        reporter.started();
        let result = self.manager.discover(&self.definition).await;
        let discovery = match result {
            Ok(discovery) => discovery,
            Err(e) => return Err(self.fail("discover", None, e, Some(&reporter))),
        };
        reporter.finished();

        let discovered: BTreeSet<String> = discovery.table.iter().map(|r| r.id.clone()).collect();
        let mut run = RunContext {
            ssh_enabled: resolve_ssh_access(&self.definition, &discovery.table),
            definition: Arc::clone(&self.definition),
            table: discovery.table,
            nodes: discovery.nodes,
        };

        let outcome = self.run_steps(&mut run).await;
        let summary = outcome.map(|(pruned, routing)| summarize(&run, &discovered, pruned, routing));
        self.context = Some(run);

        if summary.is_ok() {
            self.state = PipelineState::Succeeded;
            info!("Cluster {} provisioned", self.definition.name);
        }
        summary
    }

    async fn run_steps(
        &mut self,
        run: &mut RunContext,
    ) -> std::result::Result<(usize, RoutingOutcome), PipelineError> {
        let mut pruned = 0;
        let mut routing = RoutingOutcome::default();

        for index in 0..self.steps.len() {
            let step = self.steps[index].clone();
            self.state = PipelineState::Running(index);
            debug!("Running step {} ({})", step.name, index);

            let reporter = StepReporter::new(Arc::clone(&self.sink), step.name, step.quiet);
            reporter.started();

            let result = match step.kind {
                StepKind::Global => self
                    .run_global(step.action, run, &reporter)
                    .await
                    .map(|outcome| match outcome {
                        GlobalOutcome::Pruned(count) => pruned = count,
                        GlobalOutcome::Routed(outcome) => routing = outcome,
                        GlobalOutcome::Done => {}
                    })
                    .map_err(|e| (None, e)),
                StepKind::PerNode => {
                    let limit = self.parallelism(&step);
                    self.run_per_node(step.action, limit, run, &reporter).await
                }
            };

            if let Err((node, e)) = result {
                return Err(self.fail(step.name, node, e, Some(&reporter)));
            }
            reporter.finished();
        }

        Ok((pruned, routing))
    }

    async fn run_global(
        &self,
        action: StepAction,
        run: &mut RunContext,
        reporter: &StepReporter,
    ) -> Result<GlobalOutcome> {
        let manager = &self.manager;
        Ok(match action {
            StepAction::Network => {
                manager.provision_network(run, reporter).await?;
                GlobalOutcome::Done
            }
            StepAction::Security => {
                manager.provision_security(run, reporter).await?;
                GlobalOutcome::Done
            }
            StepAction::Prune => GlobalOutcome::Pruned(manager.prune_nodes(run, reporter).await?),
            StepAction::Placement => {
                manager.assign_placement(run, reporter).await?;
                GlobalOutcome::Done
            }
            StepAction::Routing => GlobalOutcome::Routed(manager.manage_routing(run, reporter).await?),
            StepAction::Instances | StepAction::DataDisk => {
                return Err(ProvisionError::Internal(format!(
                    "{action:?} is a per-node action"
                )));
            }
        })
    }

    /// Runs a per-node action for every declared node, at most `limit` at a time
    ///
    /// A worker hands its permit back with its result, so a slot only frees
    /// up once this loop has seen how the node went. No node is admitted
    /// after a failure has been observed.
    async fn run_per_node(
        &self,
        action: StepAction,
        limit: usize,
        run: &mut RunContext,
        reporter: &StepReporter,
    ) -> std::result::Result<(), StepFailure> {
        let shared = run.node_context();
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut workers = JoinSet::new();
        let mut finished = Vec::new();
        let mut failure: Option<StepFailure> = None;

        debug!(
            "Fanning out over {} node(s), {} at a time",
            self.definition.nodes.len(),
            limit
        );

        for node in &self.definition.nodes {
            let Some(record) = run.nodes.get(&node.name).cloned() else {
                failure = Some((
                    Some(node.name.clone()),
                    ProvisionError::Internal(format!("node '{}' was never placed", node.name)),
                ));
                break;
            };

            let permit = loop {
                while let Some(joined) = workers.try_join_next() {
                    collect(joined, &mut finished, &mut failure);
                }
                if failure.is_some() {
                    break None;
                }
                match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => break Some(permit),
                    Err(TryAcquireError::NoPermits) => match workers.join_next().await {
                        Some(joined) => collect(joined, &mut finished, &mut failure),
                        None => {
                            failure = Some((None, ProvisionError::Internal("worker pool has no free slot".into())));
                            break None;
                        }
                    },
                    Err(e) => {
                        failure = Some((None, ProvisionError::Internal(e.to_string())));
                        break None;
                    }
                }
            };
            let Some(permit) = permit else {
                break;
            };

            let manager = Arc::clone(&self.manager);
            let context = shared.clone();
            let reporter = reporter.for_node(&node.name);
            workers.spawn(async move {
                let name = record.name.clone();
                let result = run_node_action(manager.as_ref(), action, context, record, &reporter).await;
                if let Err(e) = &result {
                    reporter.failed(e.to_string());
                }
                (name, result, permit)
            });
        }

        while let Some(joined) = workers.join_next().await {
            collect(joined, &mut finished, &mut failure);
        }

        for record in finished {
            if let Some(instance) = &record.instance {
                run.table.insert(instance.clone());
            }
            for volume in &record.volumes {
                run.table.insert(volume.clone());
            }
            run.nodes.upsert(record);
        }

        match failure {
            Some(failure) => Err(failure),
            None => Ok(()),
        }
    }

    fn fail(
        &mut self,
        step: &str,
        node: Option<String>,
        source: ProvisionError,
        reporter: Option<&StepReporter>,
    ) -> PipelineError {
        self.state = PipelineState::Failed;
        if let Some(reporter) = reporter {
            reporter.failed(source.to_string());
        }
        let error = PipelineError::new(step, node, source);
        error!("{}", error);
        error
    }
}

enum GlobalOutcome {
    Done,
    Pruned(usize),
    Routed(RoutingOutcome),
}

async fn run_node_action(
    manager: &dyn HostingManager,
    action: StepAction,
    context: NodeContext,
    record: NodeRecord,
    reporter: &StepReporter,
) -> Result<NodeRecord> {
    match action {
        StepAction::Instances => manager.provision_node(context, record, reporter).await,
        StepAction::DataDisk => {
            let disk = manager.data_disk(context, &record, reporter).await?;
            debug!("Data volume of {} is {}", disk.node, disk.volume_id);
            Ok(record)
        }
        other => Err(ProvisionError::Internal(format!(
            "{other:?} is a global action"
        ))),
    }
}

/// Records a finished worker; only the first failure is kept
type WorkerOutput = (String, Result<NodeRecord>, OwnedSemaphorePermit);

/// Folds one worker's output in; its permit is released on return
fn collect(
    joined: std::result::Result<WorkerOutput, JoinError>,
    finished: &mut Vec<NodeRecord>,
    failure: &mut Option<StepFailure>,
) {
    match joined {
        Ok((_, Ok(record), _)) => finished.push(record),
        Ok((name, Err(e), _)) => {
            failure.get_or_insert((Some(name), e));
        }
        Err(e) => {
            failure.get_or_insert((None, ProvisionError::Internal(format!("node worker died: {e}"))));
        }
    }
}

fn summarize(
    run: &RunContext,
    discovered: &BTreeSet<String>,
    pruned: usize,
    routing: RoutingOutcome,
) -> RunSummary {
    let nodes = run
        .definition
        .nodes
        .iter()
        .filter_map(|node| run.nodes.get(&node.name))
        .map(|record| NodeSummary {
            name: record.name.clone(),
            role: record.role,
            phase: record.phase,
            instance_id: record.instance_id().map(str::to_string),
            ssh_port: record.ssh_port,
            partition: record.partition,
        })
        .collect();

    RunSummary {
        cluster: run.definition.name.clone(),
        discovered: discovered.len(),
        created: run
            .table
            .iter()
            .filter(|resource| !discovered.contains(&resource.id))
            .count(),
        resources: run.table.len(),
        pruned,
        ssh_enabled: run.ssh_enabled,
        nodes,
        routing,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use trellis_core::domain::{
        IngressRule, IngressTarget, InstanceState, NetworkSettings, NodeDefinition, PortRange, Protocol,
        ResourceKind,
    };
    use trellis_core::dto::InstanceAction;
    use trellis_provider::{ApiCall, InMemoryCloud};

    use crate::hosting::{CloudHostingManager, Discovery};
    use crate::instance::DataDisk;
    use crate::progress::{ProgressKind, RecordingSink};

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

    fn definition(nodes: Vec<NodeDefinition>) -> ClusterDefinition {
        ClusterDefinition {
            name: "demo".into(),
            nodes,
            ingress_rules: vec![IngressRule {
                protocol: Protocol::Tcp,
                external_port: 443,
                node_port: 30443,
                target: IngressTarget::UserIngress,
                source_cidrs: vec![],
                destination_cidrs: vec![],
                health_check: None,
            }],
            ssh_port_range: PortRange::new(2222, 2232),
            ssh_access: None,
            control_plane_partitions: 2,
            worker_partitions: 2,
            network: NetworkSettings::default(),
            admin_account: "trellis".into(),
            image_account: "admin".into(),
            machine_image: "default".into(),
        }
    }

    fn three_plus_two() -> ClusterDefinition {
        definition(vec![
            node("cp1", NodeRole::ControlPlane),
            node("cp2", NodeRole::ControlPlane),
            node("cp3", NodeRole::ControlPlane),
            node("w1", NodeRole::Worker),
            node("w2", NodeRole::Worker),
        ])
    }

    fn config() -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_millis(1),
            poll_timeout: Duration::from_millis(500),
            max_backoff: Duration::from_millis(5),
            ..EngineConfig::new()
        }
    }

    fn pipeline(cloud: &Arc<InMemoryCloud>, definition: ClusterDefinition, config: EngineConfig) -> Pipeline {
        let manager = CloudHostingManager::new("memory", cloud.clone(), "demo", &config);
        Pipeline::new(
            Arc::new(manager),
            definition,
            config,
            Arc::new(RecordingSink::new()),
        )
    }

    fn placement(summary: &RunSummary) -> Vec<(&str, u32, u16)> {
        summary
            .nodes
            .iter()
            .map(|n| (n.name.as_str(), n.partition.unwrap(), n.ssh_port.unwrap()))
            .collect()
    }

    #[tokio::test]
    async fn test_fresh_cluster_is_placed_and_ready() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut pipeline = pipeline(&cloud, three_plus_two(), config());

        let summary = pipeline.run().await.unwrap();

        assert_eq!(pipeline.state(), PipelineState::Succeeded);
        assert_eq!(
            placement(&summary),
            vec![
                ("cp1", 1, 2222),
                ("cp2", 2, 2223),
                ("cp3", 1, 2224),
                ("w1", 1, 2225),
                ("w2", 2, 2226),
            ]
        );
        assert!(summary.nodes.iter().all(|n| n.phase == NodePhase::Ready));
        assert_eq!(summary.discovered, 0);
        assert_eq!(summary.created, summary.resources);
        assert!(!summary.ssh_enabled);

        let table = pipeline.table().unwrap();
        assert_eq!(table.of_kind(ResourceKind::Instance).count(), 5);
        assert_eq!(table.of_kind(ResourceKind::Volume).count(), 5);
        assert_eq!(cloud.resources(ResourceKind::Instance).len(), 5);
    }

    #[tokio::test]
    async fn test_rerun_creates_nothing() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut first = pipeline(&cloud, three_plus_two(), config());
        let first_summary = first.run().await.unwrap();

        cloud.reset_calls();
        let mut second = pipeline(&cloud, three_plus_two(), config());
        let summary = second.run().await.unwrap();

        assert_eq!(cloud.creates(), 0);
        assert!(
            cloud
                .calls()
                .iter()
                .all(|call| call.is_read_only() || *call == ApiCall::SetTargets)
        );
        assert_eq!(second.table(), first.table());
        assert_eq!(summary.created, 0);
        assert_eq!(summary.discovered, first_summary.resources);
        assert_eq!(summary.nodes, first_summary.nodes);
    }

    #[tokio::test]
    async fn test_stuck_nat_fails_network_step() {
        let cloud = Arc::new(InMemoryCloud::new());
        cloud.stick(ResourceKind::NatGateway);
        let config = EngineConfig {
            poll_timeout: Duration::from_millis(30),
            ..config()
        };
        let mut pipeline = pipeline(&cloud, three_plus_two(), config);

        let error = pipeline.run().await.unwrap_err();

        assert_eq!(error.step, "network");
        assert_eq!(error.node, None);
        assert!(error.is_timeout());
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(cloud.count(|c| *c == ApiCall::Create(ResourceKind::SecurityGroup)), 0);
        assert_eq!(cloud.count(|c| *c == ApiCall::Create(ResourceKind::Instance)), 0);
        assert!(pipeline.table().is_some());
    }

    #[tokio::test]
    async fn test_invalid_definition_fails_before_any_call() {
        let cloud = Arc::new(InMemoryCloud::new());
        let mut def = three_plus_two();
        def.nodes[1].name = "cp1".into();
        let mut pipeline = pipeline(&cloud, def, config());

        let error = pipeline.run().await.unwrap_err();
        assert_eq!(error.step, "validate");
        assert!(cloud.calls().is_empty());
        assert!(pipeline.table().is_none());
    }

    #[tokio::test]
    async fn test_terminated_instance_names_the_node() {
        let cloud = Arc::new(InMemoryCloud::new());
        pipeline(&cloud, three_plus_two(), config()).run().await.unwrap();

        let w1 = cloud
            .resources(ResourceKind::Instance)
            .into_iter()
            .find(|i| i.logical_name() == Some("w1"))
            .unwrap();
        cloud.force_state(&w1.id, InstanceState::SHUTTING_DOWN);
        cloud.stick(ResourceKind::Instance);

        let error = pipeline(&cloud, three_plus_two(), config())
            .run()
            .await
            .unwrap_err();
        assert_eq!(error.step, "instances");
        assert_eq!(error.node.as_deref(), Some("w1"));
        assert!(matches!(error.source, ProvisionError::UnexpectedState { .. }));
    }

    #[tokio::test]
    async fn test_quiet_step_reports_nothing() {
        let cloud = Arc::new(InMemoryCloud::new());
        let sink = Arc::new(RecordingSink::new());
        let config = config();
        let manager = CloudHostingManager::new("memory", cloud.clone(), "demo", &config);
        let mut pipeline = Pipeline::new(Arc::new(manager), three_plus_two(), config, sink.clone());

        pipeline.run().await.unwrap();

        let events = sink.events();
        assert!(events.iter().all(|e| e.step != "data-disk"));
        assert!(
            events
                .iter()
                .any(|e| e.step == "instances" && e.node.as_deref() == Some("cp1"))
        );
        assert!(
            events
                .iter()
                .any(|e| e.step == "network" && e.message == "create: nat gateway")
        );
        assert!(
            events
                .iter()
                .any(|e| e.step == "routing" && e.kind == ProgressKind::Finished)
        );
    }

    #[tokio::test]
    async fn test_undeclared_node_is_pruned() {
        let cloud = Arc::new(InMemoryCloud::new());
        pipeline(&cloud, three_plus_two(), config()).run().await.unwrap();

        let mut smaller = three_plus_two();
        smaller.nodes.retain(|n| n.name != "w2");
        let mut pipeline = pipeline(&cloud, smaller, config());
        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.pruned, 1);
        assert!(pipeline.nodes().unwrap().get("w2").is_none());
        assert!(pipeline.table().unwrap().get(ResourceKind::Instance, "w2").is_none());
        assert!(pipeline.table().unwrap().get(ResourceKind::Volume, "w2-sdb").is_none());
        assert_eq!(
            cloud.count(|c| *c == ApiCall::InstanceAction(InstanceAction::Terminate)),
            1
        );
        let live = cloud
            .resources(ResourceKind::Instance)
            .into_iter()
            .filter(|i| i.state != InstanceState::TERMINATED)
            .count();
        assert_eq!(live, 4);
    }

    /// Hosting manager that only tracks per-node concurrency
    #[derive(Default)]
    struct CountingManager {
        active: AtomicUsize,
        peak: AtomicUsize,
        started: Mutex<Vec<String>>,
        routed: AtomicUsize,
    }

    #[async_trait]
    impl HostingManager for CountingManager {
        fn provider(&self) -> &str {
            "counting"
        }

        fn default_parallelism(&self) -> usize {
            3
        }

        fn validate(&self, _definition: &ClusterDefinition) -> Result<()> {
            Ok(())
        }

        async fn discover(&self, _definition: &ClusterDefinition) -> Result<Discovery> {
            Ok(Discovery::default())
        }

        async fn provision_network(&self, _run: &mut RunContext, _reporter: &StepReporter) -> Result<()> {
            Ok(())
        }

        async fn provision_security(&self, _run: &mut RunContext, _reporter: &StepReporter) -> Result<()> {
            Ok(())
        }

        async fn prune_nodes(&self, _run: &mut RunContext, _reporter: &StepReporter) -> Result<usize> {
            Ok(0)
        }

        async fn assign_placement(&self, run: &mut RunContext, _reporter: &StepReporter) -> Result<()> {
            for node in &run.definition.nodes {
                run.nodes.upsert(NodeRecord::absent(&node.name, node.role));
            }
            Ok(())
        }

        async fn provision_node(
            &self,
            _node: NodeContext,
            mut record: NodeRecord,
            _reporter: &StepReporter,
        ) -> Result<NodeRecord> {
            self.started.lock().unwrap().push(record.name.clone());
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if record.name == "bad" {
                return Err(ProvisionError::unexpected_state("instance of bad", "terminated"));
            }
            record.phase = NodePhase::Ready;
            Ok(record)
        }

        async fn data_disk(
            &self,
            _node: NodeContext,
            record: &NodeRecord,
            _reporter: &StepReporter,
        ) -> Result<DataDisk> {
            Ok(DataDisk {
                node: record.name.clone(),
                volume_id: "vol-1".into(),
                device: "/dev/sdb".into(),
                size_gb: None,
            })
        }

        async fn manage_routing(&self, _run: &mut RunContext, _reporter: &StepReporter) -> Result<RoutingOutcome> {
            self.routed.fetch_add(1, Ordering::SeqCst);
            Ok(RoutingOutcome::default())
        }
    }

    fn workers(names: &[&str]) -> ClusterDefinition {
        definition(names.iter().map(|n| node(n, NodeRole::Worker)).collect())
    }

    #[tokio::test]
    async fn test_worker_pool_is_bounded() {
        let manager = Arc::new(CountingManager::default());
        let mut pipeline = Pipeline::new(
            manager.clone(),
            workers(&["a", "b", "c", "d", "e", "f"]),
            config().with_max_parallel(2),
            Arc::new(RecordingSink::new()),
        );

        let summary = pipeline.run().await.unwrap();

        assert_eq!(summary.nodes.len(), 6);
        assert!(manager.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(manager.started.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_first_failure_stops_admission() {
        let manager = Arc::new(CountingManager::default());
        let mut pipeline = Pipeline::new(
            manager.clone(),
            workers(&["a", "bad", "c", "d"]),
            config().with_max_parallel(1),
            Arc::new(RecordingSink::new()),
        );

        let error = pipeline.run().await.unwrap_err();

        assert_eq!(error.step, "instances");
        assert_eq!(error.node.as_deref(), Some("bad"));
        assert_eq!(*manager.started.lock().unwrap(), vec!["a", "bad"]);
        assert_eq!(manager.routed.load(Ordering::SeqCst), 0);
        assert_eq!(pipeline.state(), PipelineState::Failed);
        assert_eq!(
            pipeline.nodes().unwrap().get("a").unwrap().phase,
            NodePhase::Ready
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failure_seen_before_next_admission_on_threaded_runtime() {
        for _ in 0..10 {
            let manager = Arc::new(CountingManager::default());
            let mut pipeline = Pipeline::new(
                manager.clone(),
                workers(&["a", "bad", "c", "d"]),
                config().with_max_parallel(1),
                Arc::new(RecordingSink::new()),
            );

            let error = pipeline.run().await.unwrap_err();

            assert_eq!(error.node.as_deref(), Some("bad"));
            assert_eq!(*manager.started.lock().unwrap(), vec!["a", "bad"]);
        }
    }

    #[test]
    fn test_standard_steps_order() {
        let names: Vec<&str> = standard_steps().iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["network", "security", "prune", "placement", "instances", "data-disk", "routing"]
        );
        assert!(standard_steps().iter().filter(|s| s.quiet).all(|s| s.name == "data-disk"));
    }
}
