//! Reconciliation table
//!
//! Maps every (kind, logical name) the engine manages to the provider handle
//! last observed for it. Built by discovery, extended as steps create or
//! observe resources, and only written by the control thread between steps.

use std::collections::BTreeMap;

use trellis_core::domain::{Resource, ResourceKind};
use trellis_core::{ProvisionError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationTable {
    entries: BTreeMap<(ResourceKind, String), Resource>,
}

impl ReconciliationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, kind: ResourceKind, name: &str) -> Option<&Resource> {
        self.entries.get(&(kind, name.to_string()))
    }

    /// Looks up a resource an earlier step must have ensured
    pub fn require(&self, kind: ResourceKind, name: &str) -> Result<&Resource> {
        self.get(kind, name)
            .ok_or_else(|| ProvisionError::unexpected_state(format!("{kind} '{name}'"), "absent"))
    }

    /// Records a resource under its logical name, replacing any previous handle
    ///
    /// Resources without a `name` tag are ignored and `None` is returned.
    pub fn insert(&mut self, resource: Resource) -> Option<Resource> {
        let name = resource.logical_name()?.to_string();
        self.entries.insert((resource.kind, name), resource)
    }

    pub fn remove(&mut self, kind: ResourceKind, name: &str) -> Option<Resource> {
        self.entries.remove(&(kind, name.to_string()))
    }

    /// Every recorded resource of one kind, ordered by logical name
    pub fn of_kind(&self, kind: ResourceKind) -> impl Iterator<Item = &Resource> {
        self.entries
            .iter()
            .filter(move |((k, _), _)| *k == kind)
            .map(|(_, resource)| resource)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Resource> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
