//! Node registry
//!
//! Node records live in a single arena. Two indices map node names and
//! instance ids to arena slots; they are rebuilt whenever a slot moves.

use std::collections::HashMap;

use trellis_core::domain::NodeRecord;

#[derive(Debug, Clone, Default)]
pub struct NodeRegistry {
    records: Vec<NodeRecord>,
    by_name: HashMap<String, usize>,
    by_instance: HashMap<String, usize>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record or replaces the record with the same name
    pub fn upsert(&mut self, record: NodeRecord) {
        match self.by_name.get(&record.name).copied() {
            Some(slot) => {
                if let Some(old) = self.records[slot].instance_id() {
                    self.by_instance.remove(old);
                }
                if let Some(id) = record.instance_id() {
                    self.by_instance.insert(id.to_string(), slot);
                }
                self.records[slot] = record;
            }
            None => {
                let slot = self.records.len();
                self.by_name.insert(record.name.clone(), slot);
                if let Some(id) = record.instance_id() {
                    self.by_instance.insert(id.to_string(), slot);
                }
                self.records.push(record);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&NodeRecord> {
        self.by_name.get(name).map(|&slot| &self.records[slot])
    }

    pub fn get_by_instance(&self, instance_id: &str) -> Option<&NodeRecord> {
        self.by_instance
            .get(instance_id)
            .map(|&slot| &self.records[slot])
    }

    /// Removes a node, e.g. after its instance was deprovisioned
    pub fn remove(&mut self, name: &str) -> Option<NodeRecord> {
        let slot = self.by_name.remove(name)?;
        let record = self.records.swap_remove(slot);
        if let Some(id) = record.instance_id() {
            self.by_instance.remove(id);
        }

        // The last record moved into the freed slot
        if let Some(moved) = self.records.get(slot) {
            self.by_name.insert(moved.name.clone(), slot);
            if let Some(id) = moved.instance_id() {
                self.by_instance.insert(id.to_string(), slot);
            }
        }

        Some(record)
    }

    pub fn iter(&self) -> impl Iterator<Item = &NodeRecord> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
