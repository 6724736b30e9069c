//! SSH port allocation
//!
//! Every node gets a unique external SSH port from the reserved range.
//! Ports already held by a node are never changed. Unassigned nodes are
//! served control plane first, then alphabetically, each taking the lowest
//! free port.

use std::collections::{BTreeMap, HashMap};

use trellis_core::domain::{NodeRole, PortRange, ResourceKind};
use trellis_core::{ProvisionError, Result};

/// One node asking for an SSH port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortRequest {
    pub name: String,
    pub role: NodeRole,
    /// Port the node already holds
    pub assigned: Option<u16>,
}

impl PortRequest {
    pub fn new(name: impl Into<String>, role: NodeRole, assigned: Option<u16>) -> Self {
        Self {
            name: name.into(),
            role,
            assigned,
        }
    }
}

/// Returns the SSH port of every requesting node
pub fn allocate_ports(range: PortRange, requests: &[PortRequest]) -> Result<BTreeMap<String, u16>> {
    let mut holders: HashMap<u16, &str> = HashMap::new();
    let mut allocated = BTreeMap::new();

    for request in requests {
        let Some(port) = request.assigned else {
            continue;
        };
        if let Some(holder) = holders.insert(port, &request.name) {
            return Err(ProvisionError::conflict(
                ResourceKind::Instance,
                &request.name,
                format!("SSH port {port} is already held by node '{holder}'"),
            ));
        }
        allocated.insert(request.name.clone(), port);
    }

    let mut waiting: Vec<&PortRequest> = requests.iter().filter(|r| r.assigned.is_none()).collect();
    if waiting.is_empty() {
        return Ok(allocated);
    }
    waiting.sort_by(|a, b| a.role.cmp(&b.role).then_with(|| a.name.cmp(&b.name)));

    let free: Vec<u16> = range.ports().filter(|port| !holders.contains_key(port)).collect();
    if free.len() < waiting.len() {
        return Err(ProvisionError::PortRangeExhausted {
            range,
            available: free.len(),
            needed: waiting.len(),
        });
    }

    for (request, port) in waiting.into_iter().zip(free) {
        allocated.insert(request.name.clone(), port);
    }

    Ok(allocated)
}
