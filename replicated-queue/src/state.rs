//! The replicated data model.
//!
//! This is the data that Raft replicates. Every node holds one
//! [`ReplicatedState`], owned by its [`crate::interpreter::Interpreter`], and
//! the log guarantees they all converge by applying the same commands in the
//! same order.
//!
//! # Why BTreeMap instead of HashMap?
//!
//! Snapshots are encoded straight from these maps, and two nodes holding the
//! same state must produce the same bytes. BTreeMap iterates in key order, so
//! encoding is deterministic.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Number of ticks in one second. Ticks are 100ns units.
pub const TICKS_PER_SECOND: i64 = 10_000_000;

/// Converts a whole number of seconds into ticks.
pub fn seconds_to_ticks(seconds: i32) -> i64 {
    i64::from(seconds) * TICKS_PER_SECOND
}

/// Root of all replicated state on a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatedState {
    pub key_values: BTreeMap<String, Vec<u8>>,
    pub hashsets: BTreeMap<String, BTreeMap<String, String>>,
    pub queues: BTreeMap<String, Vec<QueueElement>>,
}

impl ReplicatedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of live queue elements across all queues.
    pub fn queued_elements(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }
}

/// How a queue element is retried. Copied into every element at push time so
/// later configuration changes never alter in-flight work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// How long a running attempt may stay unacknowledged.
    pub timeout_seconds: i32,
    /// Backoff before each retry; `delays_seconds[n - 1]` precedes attempt `n + 1`.
    pub delays_seconds: Vec<i32>,
    /// Outcome codes that earn another attempt.
    pub retryable_status_codes: Vec<i32>,
}

impl RetryPolicy {
    /// Maximum number of attempts an element may receive.
    pub fn max_attempts(&self) -> usize {
        self.delays_seconds.len() + 1
    }

    pub fn is_retryable(&self, outcome_code: i32) -> bool {
        self.retryable_status_codes.contains(&outcome_code)
    }
}

/// One unit of work. Immutable except for its attempt history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueElement {
    pub value: Vec<u8>,
    pub id: String,
    pub insert_timestamp: i64,
    pub retry: RetryPolicy,
    attempts: Vec<RetryAttempt>,
}

impl QueueElement {
    pub fn new(id: String, value: Vec<u8>, insert_timestamp: i64, retry: RetryPolicy) -> Self {
        Self {
            value,
            id,
            insert_timestamp,
            retry,
            attempts: Vec::new(),
        }
    }

    /// Attempt history, oldest first.
    pub fn attempts(&self) -> &[RetryAttempt] {
        &self.attempts
    }

    pub fn current_attempt(&self) -> Option<&RetryAttempt> {
        self.attempts.last()
    }

    /// Opens a new running attempt.
    pub(crate) fn start_attempt(&mut self, now_ticks: i64) {
        self.attempts.push(RetryAttempt {
            start: now_ticks,
            status: AttemptStatus::Running,
        });
    }

    /// Closes the current attempt if it is still running. Returns whether an
    /// attempt was closed.
    pub(crate) fn close_attempt(&mut self, status: AttemptStatus) -> bool {
        match self.attempts.last_mut() {
            Some(attempt) if attempt.status == AttemptStatus::Running => {
                attempt.status = status;
                true
            }
            _ => false,
        }
    }
}

/// One delivery of a queue element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryAttempt {
    pub start: i64,
    pub status: AttemptStatus,
}

/// Where an attempt stands. A closed attempt always carries its end tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptStatus {
    Running,
    Completed { end: i64, outcome_code: i32 },
    /// Closed by the timeout sweep; always retryable.
    TimedOut { end: i64 },
}

impl AttemptStatus {
    pub fn end(&self) -> Option<i64> {
        match *self {
            AttemptStatus::Running => None,
            AttemptStatus::Completed { end, .. } | AttemptStatus::TimedOut { end } => Some(end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn element() -> QueueElement {
        QueueElement::new(
            "a".into(),
            b"payload".to_vec(),
            0,
            RetryPolicy {
                timeout_seconds: 30,
                delays_seconds: vec![2, 6],
                retryable_status_codes: vec![500],
            },
        )
    }

    #[test]
    fn close_only_touches_running_attempt() {
        let mut el = element();
        assert!(!el.close_attempt(AttemptStatus::TimedOut { end: 5 }));

        el.start_attempt(1);
        assert!(el.close_attempt(AttemptStatus::Completed {
            end: 2,
            outcome_code: 500
        }));
        // Already closed: a late close is ignored.
        assert!(!el.close_attempt(AttemptStatus::TimedOut { end: 3 }));
        assert_eq!(el.current_attempt().and_then(|a| a.status.end()), Some(2));
    }

    #[test]
    fn max_attempts_counts_the_first_delivery() {
        assert_eq!(element().retry.max_attempts(), 3);
        assert_eq!(RetryPolicy::default().max_attempts(), 1);
    }
}
