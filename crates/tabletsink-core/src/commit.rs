//! Commit Acknowledgements
//!
//! A replica that successfully finishes its part of a load answers with one
//! `TabletCommitInfo` per tablet it committed. The coordinator aggregates these
//! across local writers and remote streams and refuses to report success unless
//! every replica of every touched tablet is present.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::ids::{NodeId, TabletId};

/// Commit acknowledgement for one replica of one tablet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TabletCommitInfo {
    pub tablet_id: TabletId,
    pub node_id: NodeId,
    /// Rowset version produced by the commit, if the engine reports one.
    pub version: Option<i64>,
    /// Rows the replica applied for this tablet.
    pub num_rows: u64,
}

impl TabletCommitInfo {
    pub fn new(tablet_id: TabletId, node_id: NodeId, num_rows: u64) -> Self {
        Self {
            tablet_id,
            node_id,
            version: None,
            num_rows,
        }
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = Some(version);
        self
    }
}

/// Index of which nodes acknowledged which tablets.
#[derive(Debug, Default, Clone)]
pub struct CommitLedger {
    acked: HashMap<TabletId, HashSet<NodeId>>,
}

impl CommitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, info: &TabletCommitInfo) {
        self.acked
            .entry(info.tablet_id)
            .or_default()
            .insert(info.node_id);
    }

    pub fn extend<'a>(&mut self, infos: impl IntoIterator<Item = &'a TabletCommitInfo>) {
        for info in infos {
            self.record(info);
        }
    }

    /// Whether `node` acknowledged `tablet`.
    pub fn is_acked(&self, tablet: TabletId, node: NodeId) -> bool {
        self.acked
            .get(&tablet)
            .is_some_and(|nodes| nodes.contains(&node))
    }

    /// Replicas from `expected` that did not acknowledge `tablet`.
    pub fn missing(&self, tablet: TabletId, expected: &[NodeId]) -> Vec<NodeId> {
        expected
            .iter()
            .copied()
            .filter(|node| !self.is_acked(tablet, *node))
            .collect()
    }
}
