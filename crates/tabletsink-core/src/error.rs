//! Replica Error Types
//!
//! This module defines the error type returned by the collaborators that actually
//! move rows: the in-process storage engine (local writers) and the replica
//! transport (remote streams).
//!
//! ## Error Kinds
//!
//! - `Unavailable`: the node or stream cannot be reached (connection refused, reset)
//! - `Timeout`: the replica did not answer within its budget
//! - `Rejected`: the replica answered with a failure (disk full, tablet missing, ...)
//! - `Internal`: anything else
//!
//! Only `Unavailable` and `Timeout` are retryable; a replica that actively rejects a
//! request will reject it again.

use thiserror::Error;

use crate::ids::NodeId;

pub type Result<T> = std::result::Result<T, ReplicaError>;

/// Classification of a replica failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaErrorKind {
    Unavailable,
    Timeout,
    Rejected,
    Internal,
}

impl std::fmt::Display for ReplicaErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplicaErrorKind::Unavailable => write!(f, "unavailable"),
            ReplicaErrorKind::Timeout => write!(f, "timeout"),
            ReplicaErrorKind::Rejected => write!(f, "rejected"),
            ReplicaErrorKind::Internal => write!(f, "internal"),
        }
    }
}

/// Failure reported by a local writer or a remote replica stream.
#[derive(Debug, Clone, Error)]
#[error("replica {node} {kind}: {message}")]
pub struct ReplicaError {
    pub node: NodeId,
    pub kind: ReplicaErrorKind,
    pub message: String,
}

impl ReplicaError {
    pub fn new(node: NodeId, kind: ReplicaErrorKind, message: impl Into<String>) -> Self {
        Self {
            node,
            kind,
            message: message.into(),
        }
    }

    pub fn unavailable(node: NodeId, message: impl Into<String>) -> Self {
        Self::new(node, ReplicaErrorKind::Unavailable, message)
    }

    pub fn timeout(node: NodeId, message: impl Into<String>) -> Self {
        Self::new(node, ReplicaErrorKind::Timeout, message)
    }

    pub fn rejected(node: NodeId, message: impl Into<String>) -> Self {
        Self::new(node, ReplicaErrorKind::Rejected, message)
    }

    pub fn internal(node: NodeId, message: impl Into<String>) -> Self {
        Self::new(node, ReplicaErrorKind::Internal, message)
    }

    /// Whether retrying the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            ReplicaErrorKind::Unavailable | ReplicaErrorKind::Timeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_kinds() {
        assert!(ReplicaError::unavailable(NodeId(1), "down").is_retryable());
        assert!(ReplicaError::timeout(NodeId(1), "slow").is_retryable());
        assert!(!ReplicaError::rejected(NodeId(1), "disk full").is_retryable());
        assert!(!ReplicaError::internal(NodeId(1), "bug").is_retryable());
    }

    #[test]
    fn test_display() {
        let err = ReplicaError::rejected(NodeId(4), "tablet t9 not found");
        assert_eq!(err.to_string(), "replica node-4 rejected: tablet t9 not found");
    }
}
