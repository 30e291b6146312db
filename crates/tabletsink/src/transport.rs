//! Collaborator Interfaces
//!
//! The sink moves rows through two kinds of replica handles and never sees what is
//! behind them:
//!
//! ```text
//!                     ┌──────────────────────┐
//!   tablet replica ──►│ ReplicaRoute::Local  │──► LocalStorageEngine ──► LocalTabletWriter
//!                     ├──────────────────────┤
//!                     │ ReplicaRoute::Remote │──► ReplicaTransport   ──► ReplicaStream (xN per node)
//!                     └──────────────────────┘
//! ```
//!
//! Local writers receive the shared batch and a row selection without any
//! serialization. Remote streams receive the same pair and are responsible for
//! encoding it on the wire.
//!
//! All handles take `&self`: a stream is shared by every tablet of its node and a
//! fan-out issues appends to different tablets concurrently. Implementations keep
//! their own interior state.

use async_trait::async_trait;
use std::sync::Arc;
use tabletsink_core::{
    IndexId, LoadId, NodeId, Result, RowBatch, RowSelection, StreamId, TabletCommitInfo,
    TabletDescriptor, TabletId,
};

/// Parameters carried by every stream open of a load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOpenParams {
    pub load_id: LoadId,
    pub txn_id: i64,
    pub sender_id: u32,
    pub num_senders: u32,
    /// Position of this stream among the node's streams.
    pub stream_index: usize,
    /// Index ids the node serves for this load.
    pub indexes: Vec<IndexId>,
    pub high_priority: bool,
    pub write_file_cache: bool,
}

/// Opens replica streams to remote nodes.
#[async_trait]
pub trait ReplicaTransport: Send + Sync {
    async fn open_stream(
        &self,
        node: NodeId,
        params: &StreamOpenParams,
    ) -> Result<Arc<dyn ReplicaStream>>;
}

/// An ordered channel to one node.
///
/// Appends for the same tablet on the same stream are applied in the order they
/// were issued.
#[async_trait]
pub trait ReplicaStream: Send + Sync {
    fn stream_id(&self) -> StreamId;

    /// Tell the node it will receive rows for `tablets`.
    async fn announce(&self, tablets: &[TabletDescriptor]) -> Result<()>;

    async fn append(&self, tablet: TabletId, batch: RowBatch, rows: RowSelection) -> Result<()>;

    /// No more rows will be sent on this stream.
    async fn end_of_stream(&self) -> Result<()>;

    /// Drain the stream and commit `tablets_to_commit` on the node.
    ///
    /// Only one stream per node carries the tablet list; the others are closed with
    /// an empty one.
    async fn close(&self, tablets_to_commit: &[TabletId]) -> Result<Vec<TabletCommitInfo>>;

    /// Best effort; failures are swallowed by the implementation.
    async fn abort(&self, reason: &str);
}

/// The in-process storage engine.
#[async_trait]
pub trait LocalStorageEngine: Send + Sync {
    async fn open(
        &self,
        tablet: &TabletDescriptor,
        load_id: LoadId,
        txn_id: i64,
    ) -> Result<Arc<dyn LocalTabletWriter>>;
}

/// Writes one locally hosted tablet for one load.
#[async_trait]
pub trait LocalTabletWriter: Send + Sync {
    async fn append(&self, batch: RowBatch, rows: RowSelection) -> Result<()>;

    /// No more rows will arrive.
    async fn finish(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) -> Result<TabletCommitInfo>;

    async fn abort(&self, reason: &str);
}
