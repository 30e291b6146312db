//! Tablet Sink - Row Routing and Replicated Load Transactions
//!
//! This crate drives one load transaction from the sending side: every row of every
//! batch is routed to its partition and tablets, each row group is written to every
//! replica of its tablet, partitions are created on demand mid-load, and the load
//! commits only when every replica of every touched tablet acknowledges.
//!
//! # Layout
//!
//! - [`distribution`]: row to `(partition key, bucket)`
//! - [`topology`]: partitions, tablets and replica routes, as immutable snapshots
//! - [`resolver`]: row targets to per-tablet row groups
//! - [`stream_pool`]: streams to remote replica nodes
//! - [`local_writer`]: writers for replicas on the local node
//! - [`fanout`]: replicate row groups to every replica
//! - [`partition_sync`]: block producers while partitions are created
//! - [`sink`]: the load coordinator
//!
//! # Example
//!
//! ```ignore
//! use tabletsink::{HashDistributor, LoadSink, SinkConfig};
//!
//! let sink = LoadSink::builder(SinkConfig::default())
//!     .transport(transport)
//!     .local_engine(engine)
//!     .partition_creator(metadata)
//!     .distributor(Arc::new(HashDistributor::new("day", vec!["user_id".into()])))
//!     .partitions(partitions)
//!     .build()?;
//!
//! sink.open().await?;
//! sink.send(batch, true).await?;
//! let summary = sink.close(Ok(())).await?;
//! ```

pub mod config;
pub mod distribution;
pub mod error;
pub mod fanout;
pub mod local_writer;
pub mod partition_sync;
pub mod resolver;
pub mod retry;
pub mod sink;
pub mod state;
pub mod stats;
pub mod stream_pool;
pub mod topology;
pub mod transport;

pub use config::{RetryConfig, SinkConfig};
pub use distribution::{HashDistributor, RowDistributor, RowTarget, UNPARTITIONED_KEY};
pub use error::{Result, SinkError};
pub use partition_sync::{
    CreatePartitionRequest, CreationCompletion, CreationOutcome, PartitionCreator,
};
pub use retry::{retry_with_backoff, retry_with_jittered_backoff, RetryPolicy};
pub use sink::{LoadSink, LoadSinkBuilder, LoadSummary};
pub use state::LoadState;
pub use stats::SinkStatsSnapshot;
pub use topology::{ReplicaRoute, ReplicaTopology, TopologyDelta};
pub use transport::{
    LocalStorageEngine, LocalTabletWriter, ReplicaStream, ReplicaTransport, StreamOpenParams,
};
