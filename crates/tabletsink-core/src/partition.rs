//! Partition and Tablet Descriptors
//!
//! These are the catalog facts the sink routes against. They arrive from two places:
//! the static partition list handed to the sink when the load is opened, and the
//! completion of an on-demand partition creation request.
//!
//! ## Shape
//!
//! ```text
//! PartitionDescriptor (id, key)
//!   └── IndexTablets (base index, rollups...)
//!         └── TabletDescriptor (tablet id, ordered replica nodes)
//! ```
//!
//! A row lands in exactly one partition and is written once per index of that
//! partition; within an index the tablet is picked by the row's distribution bucket.
//! Descriptors are immutable once created.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ids::{IndexId, NodeId, PartitionId, TabletId};

/// Value of a row's partitioning key, rendered as text.
///
/// Unpartitioned tables use a single constant key for every row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PartitionKey(pub String);

impl PartitionKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PartitionKey {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// One tablet and the ordered list of nodes holding its replicas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletDescriptor {
    pub tablet_id: TabletId,
    pub partition_id: PartitionId,
    pub index_id: IndexId,
    pub replicas: Vec<NodeId>,
}

/// The tablets of one index within a partition, ordered by bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexTablets {
    pub index_id: IndexId,
    pub tablets: Vec<TabletDescriptor>,
}

/// A partition with all of its indexes and tablets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionDescriptor {
    pub id: PartitionId,
    pub key: PartitionKey,
    pub indexes: Vec<IndexTablets>,
}

impl TabletDescriptor {
    pub fn new(
        tablet_id: impl Into<TabletId>,
        partition_id: impl Into<PartitionId>,
        index_id: impl Into<IndexId>,
        replicas: Vec<NodeId>,
    ) -> Self {
        Self {
            tablet_id: tablet_id.into(),
            partition_id: partition_id.into(),
            index_id: index_id.into(),
            replicas,
        }
    }
}

impl PartitionDescriptor {
    /// Iterate over every tablet of every index of this partition.
    pub fn tablets(&self) -> impl Iterator<Item = &TabletDescriptor> {
        self.indexes.iter().flat_map(|index| index.tablets.iter())
    }

    /// Number of tablets across all indexes.
    pub fn tablet_count(&self) -> usize {
        self.indexes.iter().map(|index| index.tablets.len()).sum()
    }

    /// Build a single-index partition whose tablets are given as `(tablet_id, replicas)`.
    ///
    /// Mostly useful for tests and for unpartitioned tables without rollups.
    pub fn single_index(
        id: impl Into<PartitionId>,
        key: impl Into<PartitionKey>,
        index_id: impl Into<IndexId>,
        tablets: Vec<(i64, Vec<NodeId>)>,
    ) -> Self {
        let id = id.into();
        let index_id = index_id.into();
        let tablets = tablets
            .into_iter()
            .map(|(tablet_id, replicas)| TabletDescriptor::new(tablet_id, id, index_id, replicas))
            .collect();

        Self {
            id,
            key: key.into(),
            indexes: vec![IndexTablets { index_id, tablets }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_index_partition() {
        let partition = PartitionDescriptor::single_index(
            10,
            "2024-01-01",
            1,
            vec![(100, vec![NodeId(1), NodeId(2)]), (101, vec![NodeId(2), NodeId(3)])],
        );

        assert_eq!(partition.tablet_count(), 2);
        let ids: Vec<_> = partition.tablets().map(|t| t.tablet_id).collect();
        assert_eq!(ids, vec![TabletId(100), TabletId(101)]);
        assert!(partition
            .tablets()
            .all(|t| t.partition_id == PartitionId(10) && t.index_id == IndexId(1)));
    }

    #[test]
    fn test_partition_key_display() {
        let key = PartitionKey::from("us-east");
        assert_eq!(key.to_string(), "us-east");
        assert_eq!(key.as_str(), "us-east");
    }
}
