//! Load transaction lifecycle.
//!
//! ```text
//! Created -> Opened -> Closing -> Closed
//!               \          \
//!                +----------+-> Cancelling -> Cancelled
//! ```
//!
//! `Closed` and `Cancelled` are terminal and mutually exclusive. A load that fails
//! while `Closing` moves to `Cancelling`; cancel is allowed from any non-terminal
//! state, including `Created`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SinkError};

/// State of a load transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadState {
    /// Built but not yet opened.
    Created,
    /// Streams and writers established; accepting batches.
    Opened,
    /// Draining and waiting for commit acknowledgements.
    Closing,
    /// Every replica acknowledged.
    Closed,
    /// Abort is being broadcast.
    Cancelling,
    /// Abort finished.
    Cancelled,
}

impl std::fmt::Display for LoadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadState::Created => write!(f, "created"),
            LoadState::Opened => write!(f, "opened"),
            LoadState::Closing => write!(f, "closing"),
            LoadState::Closed => write!(f, "closed"),
            LoadState::Cancelling => write!(f, "cancelling"),
            LoadState::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl LoadState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoadState::Closed | LoadState::Cancelled)
    }

    pub fn can_transition_to(&self, next: LoadState) -> bool {
        use LoadState::*;
        matches!(
            (self, next),
            (Created, Opened)
                | (Opened, Closing)
                | (Closing, Closed)
                | (Created, Cancelling)
                | (Opened, Cancelling)
                | (Closing, Cancelling)
                | (Cancelling, Cancelled)
        )
    }

    /// Validate and perform a transition in place.
    pub fn transition(&mut self, next: LoadState) -> Result<()> {
        if self.can_transition_to(next) {
            *self = next;
            return Ok(());
        }
        if self.is_terminal() {
            return Err(SinkError::AlreadyClosed(*self));
        }
        Err(SinkError::InvalidState {
            from: *self,
            to: next,
        })
    }
}
