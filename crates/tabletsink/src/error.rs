//! Error types for tablet sink operations.
//!
//! The sink has no notion of partial success for a tablet's replica set, so the
//! taxonomy is organized by how far an error escalates rather than by where it
//! came from.
//!
//! ## Error Handling Strategy
//!
//! - **Absorbed**: `Validation` (a malformed row is filtered and counted; the load continues)
//! - **Fatal, load cancels**: `PartitionCreation`, `ReplicaUnavailable`, `Timeout`, `Internal`
//! - **Reported at close**: `Commit` (every row was written but a replica did not acknowledge)
//! - **Caller errors**: `AlreadyClosed`, `NotOpen`, `InvalidState`, `Config`
//! - **Terminal echo**: `Cancelled` (a later call on a load that was already cancelled)
//!
//! ## Examples
//!
//! ```ignore
//! use tabletsink::{LoadSink, SinkError};
//!
//! match sink.send(batch, false).await {
//!     Ok(()) => {}
//!     Err(SinkError::ReplicaUnavailable { node, message }) => {
//!         eprintln!("replica {} failed, load cancelled: {}", node, message);
//!     }
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::time::Duration;
use tabletsink_core::{NodeId, ReplicaError};
use thiserror::Error;

use crate::state::LoadState;

/// Convenience type alias for `Result<T, SinkError>`.
pub type Result<T> = std::result::Result<T, SinkError>;

/// Load-level error type.
#[derive(Debug, Clone, Error)]
pub enum SinkError {
    /// A row could not be routed (e.g. null partition key).
    ///
    /// Only surfaces per row inside the sink's statistics; the batch it belongs to
    /// is still delivered.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A batch lacks a column the distributor routes by.
    ///
    /// None of the batch could be routed, so the load cannot be complete.
    #[error("Batch schema mismatch: {0}")]
    Schema(String),

    /// The metadata service refused, failed or timed out creating a partition.
    #[error("Partition creation failed: {0}")]
    PartitionCreation(String),

    /// Opening, announcing to or appending to a replica failed.
    ///
    /// Partial replication is not allowed, so this cancels the whole load.
    #[error("Replica unavailable on {node}: {message}")]
    ReplicaUnavailable { node: NodeId, message: String },

    /// A replica failed to acknowledge its commit at close time.
    #[error("Commit failed: {0}")]
    Commit(String),

    /// The load is closing or already reached a terminal state.
    #[error("Load transaction already closed (state: {0})")]
    AlreadyClosed(LoadState),

    /// `send` or `close` before `open`.
    #[error("Load transaction is not open (state: {0})")]
    NotOpen(LoadState),

    /// The operation is not valid in the current state (e.g. send before open).
    #[error("Invalid state transition: {from} -> {to}")]
    InvalidState { from: LoadState, to: LoadState },

    /// The load was cancelled; carries the original cause.
    #[error("Load cancelled: {0}")]
    Cancelled(String),

    /// An operation exceeded its configured budget.
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Invalid sink configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error that shouldn't normally occur.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SinkError {
    /// Whether this error must escalate to cancelling the whole load.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SinkError::Schema(_)
                | SinkError::PartitionCreation(_)
                | SinkError::ReplicaUnavailable { .. }
                | SinkError::Commit(_)
                | SinkError::Timeout { .. }
                | SinkError::Internal(_)
        )
    }
}

impl From<ReplicaError> for SinkError {
    fn from(err: ReplicaError) -> Self {
        SinkError::ReplicaUnavailable {
            node: err.node,
            message: format!("{}: {}", err.kind, err.message),
        }
    }
}
