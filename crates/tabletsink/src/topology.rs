//! Replica Topology
//!
//! An immutable snapshot of every open partition of the load, the replica set of
//! each tablet, and the reverse mapping from node to the tablets it hosts.
//!
//! ## Snapshots
//!
//! The coordinator keeps the current snapshot behind an `Arc` and swaps it whole when
//! partitions are created mid-load. Readers clone the `Arc` and never observe a
//! partially merged topology.
//!
//! ```text
//! snapshot v1 ──with_partitions([p2])──► (snapshot v2, TopologyDelta)
//!                                                 │
//!                                                 ├─ new_nodes: nodes never seen before
//!                                                 ├─ remote_tablets: node → tablets to announce
//!                                                 └─ local_tablets: tablets hosted in-process
//! ```
//!
//! ## Routes
//!
//! Each replica of a tablet is classified once, when the tablet enters the topology:
//! a replica on `local_node_id` is [`ReplicaRoute::Local`], everything else is
//! [`ReplicaRoute::Remote`]. The fan-out never re-decides this per row.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use tabletsink_core::{
    IndexId, NodeId, PartitionDescriptor, PartitionId, PartitionKey, TabletDescriptor, TabletId,
};

use crate::error::{Result, SinkError};

/// How one replica of a tablet is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplicaRoute {
    /// In-process storage engine.
    Local,
    /// A replica stream to the node.
    Remote(NodeId),
}

/// A tablet and the routes to each of its replicas, in replica order.
#[derive(Debug, Clone)]
pub struct TabletPlacement {
    pub descriptor: TabletDescriptor,
    pub routes: Vec<ReplicaRoute>,
}

/// What a merge added to the topology.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopologyDelta {
    /// Partitions that were not known before.
    pub partitions: Vec<PartitionId>,
    /// Remote nodes that host no tablet in the previous snapshot.
    pub new_nodes: Vec<NodeId>,
    /// Newly added tablets per remote node.
    pub remote_tablets: BTreeMap<NodeId, Vec<TabletDescriptor>>,
    /// Newly added tablets with a local replica.
    pub local_tablets: Vec<TabletId>,
}

impl TopologyDelta {
    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct ReplicaTopology {
    local_node_id: NodeId,
    num_replicas: usize,
    partitions: HashMap<PartitionId, PartitionDescriptor>,
    by_key: HashMap<PartitionKey, PartitionId>,
    tablets: HashMap<TabletId, TabletPlacement>,
    node_tablets: BTreeMap<NodeId, Vec<TabletId>>,
    node_indexes: BTreeMap<NodeId, BTreeSet<IndexId>>,
}

impl ReplicaTopology {
    /// An empty topology for a load running on `local_node_id`.
    pub fn new(local_node_id: NodeId, num_replicas: usize) -> Self {
        Self {
            local_node_id,
            num_replicas,
            partitions: HashMap::new(),
            by_key: HashMap::new(),
            tablets: HashMap::new(),
            node_tablets: BTreeMap::new(),
            node_indexes: BTreeMap::new(),
        }
    }

    /// Build a topology from a list of partitions.
    pub fn build(
        local_node_id: NodeId,
        num_replicas: usize,
        partitions: &[PartitionDescriptor],
    ) -> Result<Self> {
        let (topology, _) = Self::new(local_node_id, num_replicas).with_partitions(partitions)?;
        Ok(topology)
    }

    /// Return a new snapshot extended with `partitions`, plus what changed.
    ///
    /// Partitions already present are skipped. Nothing is applied if any new tablet
    /// is invalid.
    pub fn with_partitions(
        &self,
        partitions: &[PartitionDescriptor],
    ) -> Result<(Self, TopologyDelta)> {
        let mut next = self.clone();
        let mut delta = TopologyDelta::default();
        let known_nodes: HashSet<NodeId> = self.node_tablets.keys().copied().collect();

        for partition in partitions {
            if next.partitions.contains_key(&partition.id) {
                continue;
            }
            next.validate_partition(partition)?;

            for tablet in partition.tablets() {
                let routes = next.routes_for(&tablet.replicas);
                for (&node, route) in tablet.replicas.iter().zip(&routes) {
                    next.node_tablets.entry(node).or_default().push(tablet.tablet_id);
                    next.node_indexes
                        .entry(node)
                        .or_default()
                        .insert(tablet.index_id);

                    match route {
                        ReplicaRoute::Local => delta.local_tablets.push(tablet.tablet_id),
                        ReplicaRoute::Remote(node) => {
                            if !known_nodes.contains(node) && !delta.new_nodes.contains(node) {
                                delta.new_nodes.push(*node);
                            }
                            delta
                                .remote_tablets
                                .entry(*node)
                                .or_default()
                                .push(tablet.clone());
                        }
                    }
                }
                next.tablets.insert(
                    tablet.tablet_id,
                    TabletPlacement {
                        descriptor: tablet.clone(),
                        routes,
                    },
                );
            }

            next.by_key.insert(partition.key.clone(), partition.id);
            next.partitions.insert(partition.id, partition.clone());
            delta.partitions.push(partition.id);
        }

        Ok((next, delta))
    }

    fn validate_partition(&self, partition: &PartitionDescriptor) -> Result<()> {
        if let Some(existing) = self.by_key.get(&partition.key) {
            return Err(SinkError::PartitionCreation(format!(
                "partition key '{}' already belongs to {}, got {}",
                partition.key, existing, partition.id
            )));
        }
        if partition.indexes.is_empty() {
            return Err(SinkError::PartitionCreation(format!(
                "partition {} has no indexes",
                partition.id
            )));
        }

        let mut seen = HashSet::new();
        for index in &partition.indexes {
            if index.tablets.is_empty() {
                return Err(SinkError::PartitionCreation(format!(
                    "index {} of partition {} has no tablets",
                    index.index_id, partition.id
                )));
            }
            for tablet in &index.tablets {
                if self.tablets.contains_key(&tablet.tablet_id) || !seen.insert(tablet.tablet_id) {
                    return Err(SinkError::PartitionCreation(format!(
                        "tablet {} appears more than once",
                        tablet.tablet_id
                    )));
                }
                if tablet.replicas.len() < self.num_replicas {
                    return Err(SinkError::PartitionCreation(format!(
                        "tablet {} has {} replicas, {} required",
                        tablet.tablet_id,
                        tablet.replicas.len(),
                        self.num_replicas
                    )));
                }
                let distinct: HashSet<_> = tablet.replicas.iter().collect();
                if distinct.len() != tablet.replicas.len() {
                    return Err(SinkError::PartitionCreation(format!(
                        "tablet {} lists a replica node twice",
                        tablet.tablet_id
                    )));
                }
            }
        }
        Ok(())
    }

    fn routes_for(&self, replicas: &[NodeId]) -> Vec<ReplicaRoute> {
        replicas
            .iter()
            .map(|&node| {
                if node == self.local_node_id {
                    ReplicaRoute::Local
                } else {
                    ReplicaRoute::Remote(node)
                }
            })
            .collect()
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node_id
    }

    pub fn partition(&self, id: PartitionId) -> Option<&PartitionDescriptor> {
        self.partitions.get(&id)
    }

    /// The open partition for `key`, if any.
    pub fn partition_by_key(&self, key: &PartitionKey) -> Option<&PartitionDescriptor> {
        self.by_key.get(key).and_then(|id| self.partitions.get(id))
    }

    pub fn contains_partition(&self, id: PartitionId) -> bool {
        self.partitions.contains_key(&id)
    }

    pub fn tablet(&self, id: TabletId) -> Option<&TabletPlacement> {
        self.tablets.get(&id)
    }

    /// Replica routes of `tablet`, empty if unknown.
    pub fn routes(&self, tablet: TabletId) -> &[ReplicaRoute] {
        self.tablets
            .get(&tablet)
            .map(|placement| placement.routes.as_slice())
            .unwrap_or(&[])
    }

    /// Tablets hosted by `node`, in the order they were added.
    pub fn tablets_for_node(&self, node: NodeId) -> &[TabletId] {
        self.node_tablets
            .get(&node)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Descriptors of the tablets hosted by `node`.
    pub fn tablet_descriptors_for_node(&self, node: NodeId) -> Vec<TabletDescriptor> {
        self.tablets_for_node(node)
            .iter()
            .filter_map(|id| self.tablets.get(id))
            .map(|placement| placement.descriptor.clone())
            .collect()
    }

    /// Index ids `node` serves, sorted.
    pub fn indexes_for_node(&self, node: NodeId) -> Vec<IndexId> {
        self.node_indexes
            .get(&node)
            .map(|indexes| indexes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every node except the local one, sorted.
    pub fn remote_nodes(&self) -> Vec<NodeId> {
        self.node_tablets
            .keys()
            .copied()
            .filter(|&node| node != self.local_node_id)
            .collect()
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn tablet_count(&self) -> usize {
        self.tablets.len()
    }
}
