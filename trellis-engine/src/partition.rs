//! Placement partition assignment
//!
//! Spreads the nodes of one role across the partitions of its placement
//! group. Fixed partitions (explicit overrides or partitions persisted on
//! existing instances) are honored first; every other node goes to the
//! partition holding the fewest nodes so far, ties going to the lowest
//! partition number.

use std::collections::BTreeMap;

use trellis_core::{ProvisionError, Result};

/// One node asking for a partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionRequest {
    pub name: String,
    /// Partition the node must land in (1-based)
    pub fixed: Option<u32>,
}

impl PartitionRequest {
    pub fn new(name: impl Into<String>, fixed: Option<u32>) -> Self {
        Self {
            name: name.into(),
            fixed,
        }
    }
}

/// Assigns a 1-based partition to every request
///
/// With a partition count of one or less every node lands in partition 1.
/// Unfixed nodes are assigned in the order given.
pub fn assign_partitions(count: u32, requests: &[PartitionRequest]) -> Result<BTreeMap<String, u32>> {
    if count <= 1 {
        return Ok(requests.iter().map(|r| (r.name.clone(), 1)).collect());
    }

    let mut load = vec![0usize; count as usize];
    let mut assigned = BTreeMap::new();

    for request in requests {
        if let Some(partition) = request.fixed {
            if partition == 0 || partition > count {
                return Err(ProvisionError::Validation(format!(
                    "node '{}' is pinned to partition {} of {}",
                    request.name, partition, count
                )));
            }
            load[(partition - 1) as usize] += 1;
            assigned.insert(request.name.clone(), partition);
        }
    }

    for request in requests.iter().filter(|r| r.fixed.is_none()) {
        // min_by_key keeps the first minimum, i.e. the lowest partition
        let (slot, _) = load
            .iter()
            .enumerate()
            .min_by_key(|(_, nodes)| **nodes)
            .ok_or_else(|| ProvisionError::Capacity("placement group has no partitions".into()))?;
        load[slot] += 1;
        assigned.insert(request.name.clone(), slot as u32 + 1);
    }

    Ok(assigned)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unfixed(names: &[&str]) -> Vec<PartitionRequest> {
        names.iter().map(|n| PartitionRequest::new(*n, None)).collect()
    }

    fn per_partition(assigned: &BTreeMap<String, u32>, count: u32) -> Vec<usize> {
        (1..=count)
            .map(|p| assigned.values().filter(|&&v| v == p).count())
            .collect()
    }

    #[test]
    fn test_balanced_spread() {
        let assigned = assign_partitions(3, &unfixed(&["a", "b", "c", "d", "e", "f", "g"])).unwrap();
        assert_eq!(per_partition(&assigned, 3), vec![3, 2, 2]);
        assert_eq!(assigned["a"], 1);
        assert_eq!(assigned["b"], 2);
        assert_eq!(assigned["c"], 3);
        assert_eq!(assigned["d"], 1);
    }

    #[test]
    fn test_spread_never_differs_by_more_than_one() {
        for count in 2..6 {
            for nodes in 0..20 {
                let names: Vec<String> = (0..nodes).map(|i| format!("n{i}")).collect();
                let requests: Vec<_> = names.iter().map(|n| PartitionRequest::new(n, None)).collect();
                let spread = per_partition(&assign_partitions(count, &requests).unwrap(), count);
                let max = spread.iter().max().unwrap();
                let min = spread.iter().min().unwrap();
                assert!(max - min <= 1, "count {count}, nodes {nodes}: {spread:?}");
            }
        }
    }

    #[test]
    fn test_fixed_partitions_take_precedence() {
        let requests = vec![
            PartitionRequest::new("a", None),
            PartitionRequest::new("b", Some(1)),
            PartitionRequest::new("c", Some(1)),
            PartitionRequest::new("d", None),
        ];
        let assigned = assign_partitions(2, &requests).unwrap();

        assert_eq!(assigned["b"], 1);
        assert_eq!(assigned["c"], 1);
        assert_eq!(assigned["a"], 2);
        assert_eq!(assigned["d"], 2);
    }

    #[test]
    fn test_single_partition() {
        let requests = vec![PartitionRequest::new("a", Some(3)), PartitionRequest::new("b", None)];
        let assigned = assign_partitions(1, &requests).unwrap();
        assert_eq!(assigned["a"], 1);
        assert_eq!(assigned["b"], 1);
        assert!(assign_partitions(0, &unfixed(&["x"])).unwrap()["x"] == 1);
    }

    #[test]
    fn test_out_of_range_pin_is_rejected() {
        let requests = vec![PartitionRequest::new("a", Some(4))];
        assert!(matches!(
            assign_partitions(3, &requests),
            Err(ProvisionError::Validation(_))
        ));
    }
}
