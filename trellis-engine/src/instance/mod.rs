//! Instance lifecycle controller
//!
//! Drives one node's instance to a running state with its bootstrap data
//! wiped:
//!
//! ```text
//! Absent -> Creating -> Pending -> Running -> Stopping -> Stopped
//!        -> BootstrapClearing -> Starting -> Running -> Ready
//! ```
//!
//! Progress is persisted on the instance itself (the `bootstrap-cleared`
//! tag), so an interrupted run resumes where it stopped. A stopped instance
//! is restarted; an instance shutting down or terminated is an error.

pub mod bootstrap;

use tracing::{debug, info, warn};
use trellis_core::domain::resource::{attrs, states, tags};
use trellis_core::domain::{
    Attributes, ClusterDefinition, InstanceState, NodeDefinition, NodePhase, NodeRecord, NodeRole, Resource,
    ResourceKind, Tags,
};
use trellis_core::dto::InstanceAction;
use trellis_core::{ProvisionError, Result};

use crate::names::{self, keys};
use crate::poller::{PollSettings, PollStatus, poll_until, wait_for_state};
use crate::progress::StepReporter;
use crate::reconciler::{Reconciler, ResourceSpec, check_purpose};
use crate::table::ReconciliationTable;

use self::bootstrap::BootstrapPayload;

/// Shared resources a node's instance is placed into
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePlacement {
    pub subnet_id: String,
    pub security_group_id: String,
    pub placement_group_id: String,
}

impl NodePlacement {
    /// Looks up the placement of a role in the table
    pub fn resolve(table: &ReconciliationTable, role: NodeRole) -> Result<Self> {
        Ok(Self {
            subnet_id: table
                .require(ResourceKind::Subnet, names::PRIVATE_SUBNET)?
                .id
                .clone(),
            security_group_id: table
                .require(ResourceKind::SecurityGroup, names::SECURITY_GROUP)?
                .id
                .clone(),
            placement_group_id: table
                .require(ResourceKind::PlacementGroup, &names::placement_group(role))?
                .id
                .clone(),
        })
    }
}

/// The data volume of a node as found by the data-disk check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataDisk {
    pub node: String,
    pub volume_id: String,
    pub device: String,
    pub size_gb: Option<u32>,
}

pub struct InstanceController<'a> {
    reconciler: &'a Reconciler,
    definition: &'a ClusterDefinition,
    poll: &'a PollSettings,
}

impl<'a> InstanceController<'a> {
    pub fn new(reconciler: &'a Reconciler, definition: &'a ClusterDefinition, poll: &'a PollSettings) -> Self {
        Self {
            reconciler,
            definition,
            poll,
        }
    }

    /// Brings the node's instance to `Ready` and returns the updated record
    ///
    /// The record must already carry its partition and SSH port.
    pub async fn reconcile(
        &self,
        mut record: NodeRecord,
        placement: &NodePlacement,
        reporter: &StepReporter,
    ) -> Result<NodeRecord> {
        let node = self.definition.node(&record.name).ok_or_else(|| {
            ProvisionError::Validation(format!("node '{}' is not declared", record.name))
        })?;
        let spec = self.instance_spec(node, &record, placement)?;

        let instance = match record.instance.take() {
            Some(existing) => {
                check_purpose(&existing, &spec)?;
                existing
            }
            None => {
                record.phase = NodePhase::Creating;
                reporter.status("create: virtual machine");
                let payload = BootstrapPayload::generate(
                    &self.definition.image_account,
                    &self.definition.admin_account,
                );
                let spec = spec.attribute(attrs::USER_DATA, payload.into_script());
                self.reconciler.ensure_with(None, spec).await?
            }
        };
        record.phase = NodePhase::Pending;

        let cleared = instance.tag(tags::BOOTSTRAP_CLEARED) == Some("true");
        reporter.status("boot: waiting for running");
        let mut instance = self.wait_booted(&instance.id, !cleared).await?;
        record.phase = match InstanceState::parse(&instance.state) {
            InstanceState::Stopped => NodePhase::Stopped,
            _ => NodePhase::Running,
        };

        record.volumes = self.tag_volumes(&record.name, &instance.id).await?;

        if !cleared {
            instance = self
                .clear_bootstrap(instance, &mut record, reporter)
                .await?;
        }

        record.phase = NodePhase::Ready;
        record.instance = Some(instance);
        debug!("Node {} ready", record.name);
        Ok(record)
    }

    fn instance_spec(
        &self,
        node: &NodeDefinition,
        record: &NodeRecord,
        placement: &NodePlacement,
    ) -> Result<ResourceSpec> {
        let (Some(partition), Some(ssh_port)) = (record.partition, record.ssh_port) else {
            return Err(ProvisionError::Internal(format!(
                "node '{}' reached instance provisioning without placement",
                record.name
            )));
        };

        Ok(ResourceSpec::new(ResourceKind::Instance, &node.name)
            .defining(keys::SUBNET, &placement.subnet_id)
            .defining(keys::PLACEMENT_GROUP, &placement.placement_group_id)
            .defining(keys::PARTITION, partition.to_string())
            .attribute(keys::SECURITY_GROUP, &placement.security_group_id)
            .attribute(keys::INSTANCE_TYPE, &node.instance_type)
            .attribute(keys::IMAGE, &self.definition.machine_image)
            .attribute(keys::DATA_VOLUME_GB, node.data_volume_gb.to_string())
            .tag(tags::NODE, &node.name)
            .tag(tags::ROLE, node.role.as_str())
            .tag(tags::PARTITION, partition.to_string())
            .tag(tags::SSH_PORT, ssh_port.to_string()))
    }

    /// Polls until the instance runs
    ///
    /// A stopped instance is restarted, unless `stopped_is_ready` is set, in
    /// which case it is returned as is. `stopped_is_ready` is set while the
    /// bootstrap data is still in place: a run interrupted after issuing the
    /// stop finds the instance `stopping`, and waits for it to stop instead of
    /// failing so the wipe can resume. Otherwise `stopping` is fatal.
    async fn wait_booted(&self, instance_id: &str, stopped_is_ready: bool) -> Result<Resource> {
        let api = self.reconciler.api();
        let operation = format!("instance {instance_id} to run");
        poll_until(&operation, self.poll, move || async move {
            let instance = api.describe(ResourceKind::Instance, instance_id).await?;
            let state = InstanceState::parse(&instance.state);
            Ok(match state {
                InstanceState::Running => PollStatus::Ready(instance),
                InstanceState::Stopped if stopped_is_ready => PollStatus::Ready(instance),
                InstanceState::Stopped => {
                    warn!("Instance {} is stopped, restarting it", instance_id);
                    api.instance_action(instance_id, InstanceAction::Start).await?;
                    PollStatus::Waiting(state.as_str().to_string())
                }
                InstanceState::Pending => PollStatus::Waiting(state.as_str().to_string()),
                InstanceState::Stopping if stopped_is_ready => {
                    PollStatus::Waiting(state.as_str().to_string())
                }
                _ => PollStatus::Fatal(ProvisionError::unexpected_state(
                    instance.label(),
                    state.as_str(),
                )),
            })
        })
        .await
    }

    /// Stops the instance, wipes its user data, starts it again and records that
    async fn clear_bootstrap(
        &self,
        instance: Resource,
        record: &mut NodeRecord,
        reporter: &StepReporter,
    ) -> Result<Resource> {
        let api = self.reconciler.api();
        let id = instance.id.clone();

        let mut instance = if instance.has_state(InstanceState::STOPPED) {
            instance
        } else {
            record.phase = NodePhase::Stopping;
            reporter.status("bootstrap: stopping");
            api.instance_action(&id, InstanceAction::Stop).await?;
            wait_for_state(
                api,
                ResourceKind::Instance,
                &id,
                InstanceState::STOPPED,
                &[
                    InstanceState::STOPPING,
                    InstanceState::RUNNING,
                    InstanceState::PENDING,
                ],
                self.poll,
            )
            .await?
        };

        record.phase = NodePhase::BootstrapClearing;
        reporter.status("bootstrap: clearing");
        let mut wipe = Attributes::new();
        wipe.insert(attrs::USER_DATA.to_string(), String::new());
        self.reconciler.sync_attributes(&mut instance, &wipe).await?;

        record.phase = NodePhase::Starting;
        reporter.status("bootstrap: starting");
        api.instance_action(&id, InstanceAction::Start).await?;
        let mut instance = self.wait_booted(&id, false).await?;
        record.phase = NodePhase::Running;

        let mut done = Tags::new();
        done.insert(tags::BOOTSTRAP_CLEARED.to_string(), "true".to_string());
        self.reconciler.sync_tags(&mut instance, &done).await?;
        info!("Cleared bootstrap data of node {}", record.name);
        Ok(instance)
    }

    /// Names every attached volume and marks it for deletion with the instance
    async fn tag_volumes(&self, node: &str, instance_id: &str) -> Result<Vec<Resource>> {
        let mut volumes = self.reconciler.api().attached_volumes(instance_id).await?;
        volumes.sort_by(|a, b| a.id.cmp(&b.id));

        let mut delete_with_instance = Attributes::new();
        delete_with_instance.insert(attrs::DELETE_ON_TERMINATION.to_string(), "true".to_string());

        for volume in &mut volumes {
            let device = volume
                .attribute(keys::DEVICE)
                .unwrap_or(volume.id.as_str())
                .to_string();
            let mut labels = Tags::new();
            labels.insert(tags::CLUSTER.to_string(), self.reconciler.cluster().to_string());
            labels.insert(tags::NAME.to_string(), names::volume(node, &device));
            labels.insert(tags::NODE.to_string(), node.to_string());

            self.reconciler.sync_tags(volume, &labels).await?;
            self.reconciler
                .sync_attributes(volume, &delete_with_instance)
                .await?;
        }
        Ok(volumes)
    }

    /// Waits for the node's data volume to be attached and in use
    pub async fn data_disk(&self, record: &NodeRecord) -> Result<DataDisk> {
        let instance_id = record.instance_id().ok_or_else(|| {
            ProvisionError::unexpected_state(format!("node '{}'", record.name), "no instance")
        })?;

        let volumes = self.reconciler.api().attached_volumes(instance_id).await?;
        let volume = volumes
            .iter()
            .find(|volume| volume.attribute(keys::DEVICE) == Some(names::DATA_DEVICE))
            .ok_or_else(|| {
                ProvisionError::unexpected_state(format!("data volume of node '{}'", record.name), "missing")
            })?;

        let volume = wait_for_state(
            self.reconciler.api(),
            ResourceKind::Volume,
            &volume.id,
            states::IN_USE,
            &[states::CREATING, states::ATTACHING],
            self.poll,
        )
        .await?;

        Ok(DataDisk {
            node: record.name.clone(),
            volume_id: volume.id.clone(),
            device: names::DATA_DEVICE.to_string(),
            size_gb: volume.attribute(keys::SIZE_GB).and_then(|s| s.parse().ok()),
        })
    }

    /// Terminates the instance of a node that is no longer declared
    pub async fn deprovision(&self, table: &mut ReconciliationTable, record: &NodeRecord) -> Result<()> {
        let Some(instance_id) = record.instance_id() else {
            return Ok(());
        };

        info!("Deprovisioning node {} ({})", record.name, instance_id);
        self.reconciler
            .api()
            .instance_action(instance_id, InstanceAction::Terminate)
            .await?;
        wait_for_state(
            self.reconciler.api(),
            ResourceKind::Instance,
            instance_id,
            InstanceState::TERMINATED,
            &[InstanceState::SHUTTING_DOWN],
            self.poll,
        )
        .await?;

        table.remove(ResourceKind::Instance, &record.name);
        let volumes: Vec<String> = table
            .of_kind(ResourceKind::Volume)
            .filter(|volume| volume.tag(tags::NODE) == Some(record.name.as_str()))
            .filter_map(|volume| volume.logical_name().map(str::to_string))
            .collect();
        for name in volumes {
            table.remove(ResourceKind::Volume, &name);
        }
        Ok(())
    }
}
