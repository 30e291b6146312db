//! Identifier Newtypes
//!
//! Every entity the sink routes between has its own id type so that a tablet id can
//! never be passed where a partition id is expected. All of them are cheap `Copy`
//! values except [`LoadId`], which wraps a UUID.
//!
//! ## Ids
//! - `LoadId`: globally unique id of one load transaction (UUID v4)
//! - `NodeId`: a storage node (backend) hosting tablet replicas
//! - `PartitionId` / `IndexId` / `TabletId`: catalog ids assigned by the metadata service
//! - `StreamId`: one of the parallel streams opened to a node for a load

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Globally unique id of a load transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LoadId(pub Uuid);

impl LoadId {
    /// Generate a fresh random load id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for LoadId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LoadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

macro_rules! numeric_id {
    ($(#[$meta:meta])* $name:ident, $inner:ty, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        pub struct $name(pub $inner);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(value: $inner) -> Self {
                Self(value)
            }
        }
    };
}

numeric_id!(
    /// A storage node hosting tablet replicas.
    NodeId,
    u64,
    "node-"
);
numeric_id!(
    /// A table partition.
    PartitionId,
    i64,
    "p"
);
numeric_id!(
    /// A materialized index of the table (base index or rollup).
    IndexId,
    i64,
    "idx"
);
numeric_id!(
    /// A tablet: one replicated shard of a partition's index.
    TabletId,
    i64,
    "t"
);

/// One of the parallel streams a load keeps open to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StreamId {
    pub node: NodeId,
    pub index: usize,
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/s{}", self.node, self.index)
    }
}
