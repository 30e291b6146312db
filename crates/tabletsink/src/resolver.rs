//! Partition Resolver
//!
//! Turns per-row targets into row groups keyed by tablet, against one topology
//! snapshot. Pure: the same targets and snapshot always give the same resolution.
//!
//! ```text
//! row ──RowTarget{key, bucket}──► partition open? ──yes──► for each index:
//!                                       │                  tablets[bucket % len] += row
//!                                       └──no──► unresolved[key] += row
//! ```
//!
//! Rows whose target could not be computed are filtered with their reason; the
//! rest of the batch is unaffected.

use std::collections::BTreeMap;
use tabletsink_core::{IndexId, PartitionId, PartitionKey, RowSelection, TabletId};

use crate::distribution::RowTarget;
use crate::topology::ReplicaTopology;

/// Rows of one batch bound for one tablet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowGroup {
    pub partition_id: PartitionId,
    pub index_id: IndexId,
    pub rows: Vec<u32>,
}

impl RowGroup {
    pub fn selection(&self) -> RowSelection {
        RowSelection::new(self.rows.clone())
    }
}

pub type RowsForTablet = BTreeMap<TabletId, RowGroup>;

/// A row waiting for its partition to be created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingRow {
    pub row: u32,
    pub bucket: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resolution {
    pub rows_for_tablet: RowsForTablet,
    pub unresolved: BTreeMap<PartitionKey, Vec<PendingRow>>,
    pub filtered: Vec<(u32, String)>,
}

impl Resolution {
    /// Distinct rows routed to at least one tablet.
    pub fn routed_rows(&self) -> usize {
        let mut rows: Vec<u32> = self
            .rows_for_tablet
            .values()
            .flat_map(|group| group.rows.iter().copied())
            .collect();
        rows.sort_unstable();
        rows.dedup();
        rows.len()
    }

    pub fn unresolved_rows(&self) -> usize {
        self.unresolved.values().map(Vec::len).sum()
    }

    pub fn missing_keys(&self) -> Vec<PartitionKey> {
        self.unresolved.keys().cloned().collect()
    }

    /// Fold `other` into `self`, keeping each tablet's rows in ascending order.
    pub fn merge(&mut self, other: Resolution) {
        for (tablet, group) in other.rows_for_tablet {
            match self.rows_for_tablet.get_mut(&tablet) {
                Some(existing) => {
                    existing.rows.extend(group.rows);
                    existing.rows.sort_unstable();
                }
                None => {
                    self.rows_for_tablet.insert(tablet, group);
                }
            }
        }
        for (key, rows) in other.unresolved {
            self.unresolved.entry(key).or_default().extend(rows);
        }
        self.filtered.extend(other.filtered);
    }
}

/// Resolve every row of a batch from its computed targets.
pub fn resolve(
    targets: &[Result<RowTarget, String>],
    topology: &ReplicaTopology,
) -> Resolution {
    let mut resolution = Resolution::default();

    for (row, target) in targets.iter().enumerate() {
        let row = row as u32;
        match target {
            Ok(target) => match topology.partition_by_key(&target.partition_key) {
                Some(_) => route_row(
                    &mut resolution,
                    topology,
                    &target.partition_key,
                    row,
                    target.bucket,
                ),
                None => resolution
                    .unresolved
                    .entry(target.partition_key.clone())
                    .or_default()
                    .push(PendingRow {
                        row,
                        bucket: target.bucket,
                    }),
            },
            Err(reason) => resolution.filtered.push((row, reason.clone())),
        }
    }

    resolution
}

/// Re-resolve rows that were waiting on partition creation.
///
/// Rows whose partition is still missing stay unresolved.
pub fn resolve_pending(
    pending: BTreeMap<PartitionKey, Vec<PendingRow>>,
    topology: &ReplicaTopology,
) -> Resolution {
    let mut resolution = Resolution::default();

    for (key, rows) in pending {
        if topology.partition_by_key(&key).is_none() {
            resolution.unresolved.insert(key, rows);
            continue;
        }
        for pending in rows {
            route_row(&mut resolution, topology, &key, pending.row, pending.bucket);
        }
    }

    resolution
}

fn route_row(
    resolution: &mut Resolution,
    topology: &ReplicaTopology,
    key: &PartitionKey,
    row: u32,
    bucket: u64,
) {
    let Some(partition) = topology.partition_by_key(key) else {
        return;
    };

    for index in &partition.indexes {
        if index.tablets.is_empty() {
            continue;
        }
        let tablet = &index.tablets[(bucket % index.tablets.len() as u64) as usize];
        resolution
            .rows_for_tablet
            .entry(tablet.tablet_id)
            .or_insert_with(|| RowGroup {
                partition_id: partition.id,
                index_id: index.index_id,
                rows: Vec::new(),
            })
            .rows
            .push(row);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tabletsink_core::{IndexTablets, NodeId, PartitionDescriptor, TabletDescriptor};

    fn target(key: &str, bucket: u64) -> Result<RowTarget, String> {
        Ok(RowTarget {
            partition_key: PartitionKey::new(key),
            bucket,
        })
    }

    fn topology() -> ReplicaTopology {
        let partition = PartitionDescriptor::single_index(
            1,
            "a",
            10,
            vec![(100, vec![NodeId(2)]), (101, vec![NodeId(3)])],
        );
        ReplicaTopology::build(NodeId(1), 1, &[partition]).unwrap()
    }

    #[test]
    fn test_bucket_selects_tablet() {
        let targets = vec![target("a", 0), target("a", 1), target("a", 4)];
        let resolution = resolve(&targets, &topology());

        assert_eq!(resolution.rows_for_tablet[&TabletId(100)].rows, vec![0, 2]);
        assert_eq!(resolution.rows_for_tablet[&TabletId(101)].rows, vec![1]);
        assert_eq!(
            resolution.rows_for_tablet[&TabletId(100)].partition_id,
            PartitionId(1)
        );
        assert!(resolution.unresolved.is_empty());
        assert_eq!(resolution.routed_rows(), 3);
    }

    #[test]
    fn test_unknown_partition_is_unresolved() {
        let targets = vec![target("a", 0), target("b", 7), target("b", 8)];
        let resolution = resolve(&targets, &topology());

        assert_eq!(resolution.missing_keys(), vec![PartitionKey::new("b")]);
        assert_eq!(
            resolution.unresolved[&PartitionKey::new("b")],
            vec![PendingRow { row: 1, bucket: 7 }, PendingRow { row: 2, bucket: 8 }]
        );
        assert_eq!(resolution.unresolved_rows(), 2);
    }

    #[test]
    fn test_errors_are_filtered() {
        let targets = vec![Err("null partition key".to_string()), target("a", 1)];
        let resolution = resolve(&targets, &topology());

        assert_eq!(resolution.filtered, vec![(0, "null partition key".to_string())]);
        assert_eq!(resolution.routed_rows(), 1);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let targets = vec![target("a", 3), target("a", 9), target("b", 1)];
        let topology = topology();
        assert_eq!(resolve(&targets, &topology), resolve(&targets, &topology));
    }

    #[test]
    fn test_row_written_once_per_index() {
        let partition = PartitionDescriptor {
            id: PartitionId(1),
            key: PartitionKey::new("a"),
            indexes: vec![
                IndexTablets {
                    index_id: IndexId(10),
                    tablets: vec![TabletDescriptor::new(100, 1, 10, vec![NodeId(2)])],
                },
                IndexTablets {
                    index_id: IndexId(11),
                    tablets: vec![
                        TabletDescriptor::new(110, 1, 11, vec![NodeId(2)]),
                        TabletDescriptor::new(111, 1, 11, vec![NodeId(2)]),
                    ],
                },
            ],
        };
        let topology = ReplicaTopology::build(NodeId(1), 1, &[partition]).unwrap();
        let resolution = resolve(&[target("a", 1)], &topology);

        assert_eq!(resolution.rows_for_tablet.len(), 2);
        assert_eq!(resolution.rows_for_tablet[&TabletId(100)].rows, vec![0]);
        assert_eq!(resolution.rows_for_tablet[&TabletId(111)].index_id, IndexId(11));
        assert_eq!(resolution.routed_rows(), 1);
    }

    #[test]
    fn test_resolve_pending_after_creation() {
        let targets = vec![target("a", 0), target("b", 5)];
        let v1 = topology();
        let mut resolution = resolve(&targets, &v1);
        let pending = std::mem::take(&mut resolution.unresolved);

        let created = PartitionDescriptor::single_index(2, "b", 10, vec![(200, vec![NodeId(3)])]);
        let (v2, _) = v1.with_partitions(&[created]).unwrap();
        resolution.merge(resolve_pending(pending, &v2));

        assert!(resolution.unresolved.is_empty());
        assert_eq!(resolution.rows_for_tablet[&TabletId(200)].rows, vec![1]);
        assert_eq!(resolution.routed_rows(), 2);
    }
}
