//! Core types shared by the tablet sink crates: identifiers, partition and tablet
//! descriptors, shared row batches, commit acknowledgements and the replica error type.

pub mod batch;
pub mod commit;
pub mod error;
pub mod ids;
pub mod partition;

pub use batch::{RowBatch, RowSelection};
pub use commit::{CommitLedger, TabletCommitInfo};
pub use error::{ReplicaError, ReplicaErrorKind, Result};
pub use ids::{IndexId, LoadId, NodeId, PartitionId, StreamId, TabletId};
pub use partition::{IndexTablets, PartitionDescriptor, PartitionKey, TabletDescriptor};
