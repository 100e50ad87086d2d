//! Error types shared across the crate.
//!
//! The apply path itself is total and never fails; errors only arise at the
//! edges: decoding bytes from the log or a snapshot, and waiting on the
//! replicated log from the HTTP layer.

use std::time::Duration;

use thiserror::Error;

/// Failure to encode or decode a command.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("command codec failed: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("snapshot payload holds command id {0}, expected a snapshot")]
    NotASnapshot(u32),
}

/// Failure of an operation routed through the replicated log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    /// This node cannot accept writes. `leader` is the current leader, if known.
    #[error("not the leader (leader: {leader:?})")]
    NotLeader { leader: Option<u64> },

    #[error("timed out after {0:?} waiting for the replicated log")]
    Timeout(Duration),

    /// Leadership was lost while the proposal was in flight; it may or may not
    /// have committed.
    #[error("leadership lost before the proposal was applied")]
    LeadershipLost,

    #[error("proposal rejected: {0}")]
    Rejected(String),

    #[error("node worker has shut down")]
    Shutdown,
}

impl LogError {
    /// Whether a caller may simply retry the same request.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, LogError::Rejected(_))
    }
}
