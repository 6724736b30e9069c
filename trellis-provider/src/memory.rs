//! In-memory cloud
//!
//! A complete in-process provider. Every call is recorded so callers can
//! assert which operations a run issued. Long-running operations settle
//! after a configurable number of `describe` calls, and individual kinds can
//! be pinned in their initial state to simulate operations that never finish.
//! Target registration lags the same way: new membership shows up in
//! `registered_targets` only after that many reads.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;
use trellis_core::ProviderError;
use trellis_core::domain::resource::{attrs, states};
use trellis_core::domain::{Attributes, InstanceState, Resource, ResourceKind, TagFilter, Tags};
use trellis_core::dto::{AclEntry, Association, CreateResource, InstanceAction};
use uuid::Uuid;

use crate::{CloudApi, Result};

/// Attribute carrying the data volume size requested at instance creation
pub const DATA_VOLUME_SIZE: &str = "data-volume-gb";

/// A recorded provider call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiCall {
    List(ResourceKind),
    Describe(ResourceKind),
    Create(ResourceKind),
    Delete(ResourceKind),
    Tag(ResourceKind),
    Modify(ResourceKind),
    Associate,
    CreateRoute,
    InstanceAction(InstanceAction),
    AttachedVolumes,
    AclEntries,
    ReplaceAclEntries,
    RegisteredTargets,
    SetTargets,
}

impl ApiCall {
    /// Whether the call only reads provider state
    pub fn is_read_only(&self) -> bool {
        matches!(
            self,
            ApiCall::List(_)
                | ApiCall::Describe(_)
                | ApiCall::AttachedVolumes
                | ApiCall::AclEntries
                | ApiCall::RegisteredTargets
        )
    }
}

#[derive(Default)]
struct CloudState {
    resources: BTreeMap<String, Resource>,
    acl_entries: HashMap<String, Vec<AclEntry>>,
    targets: HashMap<String, Vec<String>>,
    /// Requested membership and reads left before it registers
    pending_targets: HashMap<String, (Vec<String>, u32)>,
    calls: Vec<ApiCall>,
    /// Describes left before a transitional state settles
    settling: HashMap<String, u32>,
    stuck: HashSet<ResourceKind>,
    describe_failures: VecDeque<ProviderError>,
}

/// In-process cloud provider
pub struct InMemoryCloud {
    state: Mutex<CloudState>,
    settle_after: u32,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCloud {
    /// Creates an empty cloud where transitional states settle on the first describe
    pub fn new() -> Self {
        Self::with_settle_after(1)
    }

    /// Creates an empty cloud where transitional states settle after `describes` describe calls
    pub fn with_settle_after(describes: u32) -> Self {
        Self {
            state: Mutex::new(CloudState::default()),
            settle_after: describes.max(1),
        }
    }

    // =============================================================================
    // Fault injection & seeding
    // =============================================================================

    /// Resources of this kind never leave their initial transitional state
    ///
    /// Sticking `TargetGroup` keeps requested membership from ever registering.
    pub fn stick(&self, kind: ResourceKind) {
        self.state.lock().unwrap().stuck.insert(kind);
    }

    /// The next describe calls fail with these errors, in order
    pub fn fail_next_describes(&self, errors: impl IntoIterator<Item = ProviderError>) {
        self.state
            .lock()
            .unwrap()
            .describe_failures
            .extend(errors);
    }

    /// Overwrites the state of a resource
    pub fn force_state(&self, id: &str, new_state: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(resource) = state.resources.get_mut(id) {
            resource.state = new_state.to_string();
        }
        state.settling.insert(id.to_string(), self.settle_after);
    }

    /// Inserts a resource as-is, e.g. one left behind by someone else
    pub fn seed(&self, resource: Resource) {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(resource.id.clone(), resource);
    }

    // =============================================================================
    // Inspection
    // =============================================================================

    pub fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn reset_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Number of recorded calls matching the predicate
    pub fn count(&self, predicate: impl Fn(&ApiCall) -> bool) -> usize {
        self.state
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|call| predicate(call))
            .count()
    }

    /// Number of create calls, across every kind
    pub fn creates(&self) -> usize {
        self.count(|call| matches!(call, ApiCall::Create(_)))
    }

    /// Every live resource of a kind
    pub fn resources(&self, kind: ResourceKind) -> Vec<Resource> {
        self.state
            .lock()
            .unwrap()
            .resources
            .values()
            .filter(|resource| resource.kind == kind)
            .cloned()
            .collect()
    }

    pub fn resource(&self, id: &str) -> Option<Resource> {
        self.state.lock().unwrap().resources.get(id).cloned()
    }

    /// Current entries of an ACL, without recording a call
    pub fn peek_acl_entries(&self, acl_id: &str) -> Vec<AclEntry> {
        self.state
            .lock()
            .unwrap()
            .acl_entries
            .get(acl_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Current members of a target group, without recording a call
    pub fn peek_targets(&self, target_group_id: &str) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .targets
            .get(target_group_id)
            .cloned()
            .unwrap_or_default()
    }

    // =============================================================================
    // Internals
    // =============================================================================

    fn new_id(kind: ResourceKind) -> String {
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}-{}", kind.id_prefix(), &suffix[..12])
    }

    fn initial_state(kind: ResourceKind) -> &'static str {
        match kind {
            ResourceKind::NatGateway => states::PENDING,
            ResourceKind::LoadBalancer => states::PROVISIONING,
            ResourceKind::Instance => InstanceState::PENDING,
            ResourceKind::Volume => states::IN_USE,
            _ => states::AVAILABLE,
        }
    }

    /// The state a transitional state settles into, if any
    fn settled_state(kind: ResourceKind, current: &str) -> Option<&'static str> {
        match (kind, current) {
            (ResourceKind::NatGateway, states::PENDING) => Some(states::AVAILABLE),
            (ResourceKind::LoadBalancer, states::PROVISIONING) => Some(states::ACTIVE),
            (ResourceKind::Instance, InstanceState::PENDING) => Some(InstanceState::RUNNING),
            (ResourceKind::Instance, InstanceState::STOPPING) => Some(InstanceState::STOPPED),
            (ResourceKind::Instance, InstanceState::SHUTTING_DOWN) => {
                Some(InstanceState::TERMINATED)
            }
            (ResourceKind::Volume, states::CREATING | states::ATTACHING) => Some(states::IN_USE),
            _ => None,
        }
    }

    fn not_found(kind: ResourceKind, id: &str) -> ProviderError {
        ProviderError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    fn lookup<'a>(
        state: &'a mut CloudState,
        kind: ResourceKind,
        id: &str,
    ) -> Result<&'a mut Resource> {
        state
            .resources
            .get_mut(id)
            .filter(|resource| resource.kind == kind)
            .ok_or_else(|| Self::not_found(kind, id))
    }

    fn begin_transition(&self, state: &mut CloudState, id: &str, to: &str) -> Result<()> {
        let resource = Self::lookup(state, ResourceKind::Instance, id)?;
        resource.state = to.to_string();
        state.settling.insert(id.to_string(), self.settle_after);
        Ok(())
    }

    fn terminate(&self, state: &mut CloudState, id: &str) -> Result<()> {
        self.begin_transition(state, id, InstanceState::SHUTTING_DOWN)?;
        let doomed: Vec<String> = state
            .resources
            .values()
            .filter(|r| {
                r.kind == ResourceKind::Volume
                    && r.attribute(attrs::ATTACHED_TO) == Some(id)
                    && r.attribute(attrs::DELETE_ON_TERMINATION) == Some("true")
            })
            .map(|r| r.id.clone())
            .collect();
        for volume in doomed {
            state.resources.remove(&volume);
        }
        Ok(())
    }
}

#[async_trait]
impl CloudApi for InMemoryCloud {
    async fn list(&self, kind: ResourceKind, filter: &TagFilter) -> Result<Vec<Resource>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::List(kind));

        Ok(state
            .resources
            .values()
            .filter(|resource| resource.kind == kind && filter.matches(&resource.tags))
            .cloned()
            .collect())
    }

    async fn describe(&self, kind: ResourceKind, id: &str) -> Result<Resource> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::Describe(kind));

        if let Some(error) = state.describe_failures.pop_front() {
            return Err(error);
        }

        let stuck = state.stuck.contains(&kind);
        let remaining = state.settling.get(id).copied().unwrap_or(self.settle_after);
        let resource = Self::lookup(&mut state, kind, id)?;

        if !stuck {
            if let Some(next) = Self::settled_state(kind, &resource.state) {
                if remaining <= 1 {
                    debug!(%id, from = %resource.state, to = next, "resource settled");
                    resource.state = next.to_string();
                    let snapshot = resource.clone();
                    state.settling.remove(id);
                    return Ok(snapshot);
                }
                let snapshot = resource.clone();
                state.settling.insert(id.to_string(), remaining - 1);
                return Ok(snapshot);
            }
        }

        Ok(resource.clone())
    }

    async fn create(&self, request: CreateResource) -> Result<Resource> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::Create(request.kind));

        let resource = Resource {
            kind: request.kind,
            id: Self::new_id(request.kind),
            state: Self::initial_state(request.kind).to_string(),
            tags: request.tags,
            attributes: request.attributes,
        };

        if resource.kind == ResourceKind::Instance {
            let mut volume_attrs = Attributes::new();
            volume_attrs.insert(attrs::ATTACHED_TO.to_string(), resource.id.clone());
            volume_attrs.insert("device".to_string(), "/dev/sdb".to_string());
            volume_attrs.insert(attrs::DELETE_ON_TERMINATION.to_string(), "false".to_string());
            if let Some(size) = resource.attribute(DATA_VOLUME_SIZE) {
                volume_attrs.insert("size-gb".to_string(), size.to_string());
            }
            let volume = Resource {
                kind: ResourceKind::Volume,
                id: Self::new_id(ResourceKind::Volume),
                state: states::IN_USE.to_string(),
                tags: Tags::new(),
                attributes: volume_attrs,
            };
            state.resources.insert(volume.id.clone(), volume);
        }

        if resource.kind == ResourceKind::NetworkAcl {
            state.acl_entries.insert(resource.id.clone(), Vec::new());
        }

        debug!(kind = %resource.kind, id = %resource.id, "created resource");
        state.settling.insert(resource.id.clone(), self.settle_after);
        state.resources.insert(resource.id.clone(), resource.clone());
        Ok(resource)
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::Delete(kind));

        Self::lookup(&mut state, kind, id)?;
        if kind == ResourceKind::Instance {
            return self.terminate(&mut state, id);
        }
        state.resources.remove(id);
        state.acl_entries.remove(id);
        state.targets.remove(id);
        state.pending_targets.remove(id);
        Ok(())
    }

    async fn tag(&self, kind: ResourceKind, id: &str, tags: &Tags) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::Tag(kind));

        let resource = Self::lookup(&mut state, kind, id)?;
        resource
            .tags
            .extend(tags.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn modify(&self, kind: ResourceKind, id: &str, attributes: &Attributes) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::Modify(kind));

        let resource = Self::lookup(&mut state, kind, id)?;
        for (key, value) in attributes {
            if value.is_empty() {
                resource.attributes.remove(key);
            } else {
                resource.attributes.insert(key.clone(), value.clone());
            }
        }
        Ok(())
    }

    async fn associate(&self, association: &Association) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::Associate);

        let (target_kind, target_id, source_kind, source_id, key) = match association {
            Association::InternetGateway {
                gateway_id,
                network_id,
            } => (
                ResourceKind::InternetGateway,
                gateway_id,
                ResourceKind::Network,
                network_id,
                attrs::ATTACHED_NETWORK,
            ),
            Association::RouteTable {
                route_table_id,
                subnet_id,
            } => (
                ResourceKind::Subnet,
                subnet_id,
                ResourceKind::RouteTable,
                route_table_id,
                attrs::ROUTE_TABLE,
            ),
            Association::NetworkAcl { acl_id, subnet_id } => (
                ResourceKind::Subnet,
                subnet_id,
                ResourceKind::NetworkAcl,
                acl_id,
                attrs::NETWORK_ACL,
            ),
        };

        Self::lookup(&mut state, source_kind, source_id)?;
        let target = Self::lookup(&mut state, target_kind, target_id)?;
        target.attributes.insert(key.to_string(), source_id.clone());
        Ok(())
    }

    async fn create_route(
        &self,
        route_table_id: &str,
        destination: &str,
        target_id: &str,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::CreateRoute);

        if !state.resources.contains_key(target_id) {
            return Err(ProviderError::rejected(
                400,
                format!("route target {target_id} does not exist"),
            ));
        }
        let table = Self::lookup(&mut state, ResourceKind::RouteTable, route_table_id)?;
        table
            .attributes
            .insert(attrs::route(destination), target_id.to_string());
        Ok(())
    }

    async fn instance_action(&self, instance_id: &str, action: InstanceAction) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::InstanceAction(action));

        let current = Self::lookup(&mut state, ResourceKind::Instance, instance_id)?
            .state
            .clone();
        match (action, InstanceState::parse(&current)) {
            (InstanceAction::Start, InstanceState::Stopped) => {
                self.begin_transition(&mut state, instance_id, InstanceState::PENDING)
            }
            (InstanceAction::Start, InstanceState::Running | InstanceState::Pending) => Ok(()),
            (InstanceAction::Stop, InstanceState::Running | InstanceState::Pending) => {
                self.begin_transition(&mut state, instance_id, InstanceState::STOPPING)
            }
            (InstanceAction::Stop, InstanceState::Stopping | InstanceState::Stopped) => Ok(()),
            (InstanceAction::Terminate, InstanceState::Terminated) => Ok(()),
            (InstanceAction::Terminate, _) => self.terminate(&mut state, instance_id),
            (action, current) => Err(ProviderError::rejected(
                409,
                format!(
                    "cannot {} instance {} in state {}",
                    action.as_str(),
                    instance_id,
                    current.as_str()
                ),
            )),
        }
    }

    async fn attached_volumes(&self, instance_id: &str) -> Result<Vec<Resource>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::AttachedVolumes);

        Ok(state
            .resources
            .values()
            .filter(|r| {
                r.kind == ResourceKind::Volume && r.attribute(attrs::ATTACHED_TO) == Some(instance_id)
            })
            .cloned()
            .collect())
    }

    async fn acl_entries(&self, acl_id: &str) -> Result<Vec<AclEntry>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::AclEntries);

        Self::lookup(&mut state, ResourceKind::NetworkAcl, acl_id)?;
        Ok(state.acl_entries.get(acl_id).cloned().unwrap_or_default())
    }

    async fn replace_acl_entries(&self, acl_id: &str, entries: &[AclEntry]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::ReplaceAclEntries);

        Self::lookup(&mut state, ResourceKind::NetworkAcl, acl_id)?;
        state
            .acl_entries
            .insert(acl_id.to_string(), entries.to_vec());
        Ok(())
    }

    async fn registered_targets(&self, target_group_id: &str) -> Result<Vec<String>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::RegisteredTargets);

        Self::lookup(&mut state, ResourceKind::TargetGroup, target_group_id)?;
        if !state.stuck.contains(&ResourceKind::TargetGroup) {
            if let Some((members, remaining)) = state.pending_targets.remove(target_group_id) {
                if remaining <= 1 {
                    debug!(target_group = %target_group_id, "targets registered");
                    state.targets.insert(target_group_id.to_string(), members);
                } else {
                    state
                        .pending_targets
                        .insert(target_group_id.to_string(), (members, remaining - 1));
                }
            }
        }
        Ok(state
            .targets
            .get(target_group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn set_targets(&self, target_group_id: &str, instance_ids: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(ApiCall::SetTargets);

        Self::lookup(&mut state, ResourceKind::TargetGroup, target_group_id)?;
        for id in instance_ids {
            Self::lookup(&mut state, ResourceKind::Instance, id)?;
        }
        state.pending_targets.insert(
            target_group_id.to_string(),
            (instance_ids.to_vec(), self.settle_after),
        );
        Ok(())
    }
}
