//! Deterministic command interpreter.
//!
//! The interpreter is the single writer of [`ReplicatedState`]. It applies
//! commands in log order, never reads a clock and never performs I/O, so two
//! nodes that apply the same log end up with equal state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::command::Command;
use crate::schedule::{self, OutcomeReport, PoppedItem, QueueStats};
use crate::state::{QueueElement, ReplicatedState, RetryPolicy};

/// Result of applying one command, handed back to whoever proposed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    Stored,
    Pushed { id: String },
    /// The push was ignored because the queue already holds an element with
    /// this id.
    DuplicateId { id: String },
    Popped(Vec<PoppedItem>),
    Outcome(OutcomeReport),
    Restored,
}

/// A read against the applied state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
    Get { key: String },
    HashGetAll { key: String },
    /// Queue counts classified at `now_ticks`.
    QueueStats { key: String, now_ticks: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryResult {
    Value(Option<Vec<u8>>),
    Hashset(Option<BTreeMap<String, String>>),
    QueueStats(QueueStats),
}

#[derive(Debug, Default, Clone)]
pub struct Interpreter {
    state: ReplicatedState,
}

impl Interpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &ReplicatedState {
        &self.state
    }

    pub fn into_state(self) -> ReplicatedState {
        self.state
    }

    pub fn apply(&mut self, command: Command) -> ApplyOutcome {
        match command {
            Command::SetKeyValue { key, value } => {
                self.state.key_values.insert(key, value);
                ApplyOutcome::Stored
            }
            Command::SetHashset { key, fields } => {
                self.state.hashsets.insert(key, fields);
                ApplyOutcome::Stored
            }
            Command::QueuePush {
                key,
                id,
                now_ticks,
                retry_timeout_seconds,
                retry_delays_seconds,
                retryable_status_codes,
                value,
            } => {
                let queue = self.state.queues.entry(key).or_default();
                if queue.iter().any(|element| element.id == id) {
                    return ApplyOutcome::DuplicateId { id };
                }
                let retry = RetryPolicy {
                    timeout_seconds: retry_timeout_seconds,
                    delays_seconds: retry_delays_seconds,
                    retryable_status_codes,
                };
                queue.push(QueueElement::new(id.clone(), value, now_ticks, retry));
                ApplyOutcome::Pushed { id }
            }
            Command::QueuePop {
                key,
                count,
                now_ticks,
            } => {
                let popped = match self.state.queues.get_mut(&key) {
                    Some(queue) => schedule::pop(queue, count, now_ticks),
                    None => Vec::new(),
                };
                self.drop_if_empty(&key);
                ApplyOutcome::Popped(popped)
            }
            Command::QueueOutcome {
                key,
                id,
                now_ticks,
                outcome_code,
            } => {
                let report = match self.state.queues.get_mut(&key) {
                    Some(queue) => schedule::record_outcome(queue, &id, outcome_code, now_ticks),
                    None => OutcomeReport::UnknownElement,
                };
                self.drop_if_empty(&key);
                ApplyOutcome::Outcome(report)
            }
            Command::Snapshot(state) => {
                self.state = state;
                ApplyOutcome::Restored
            }
        }
    }

    /// Queues that drain completely are removed so they don't linger in
    /// snapshots.
    fn drop_if_empty(&mut self, key: &str) {
        if self.state.queues.get(key).is_some_and(Vec::is_empty) {
            self.state.queues.remove(key);
        }
    }

    pub fn query(&self, query: &Query) -> QueryResult {
        match query {
            Query::Get { key } => QueryResult::Value(self.state.key_values.get(key).cloned()),
            Query::HashGetAll { key } => {
                QueryResult::Hashset(self.state.hashsets.get(key).cloned())
            }
            Query::QueueStats { key, now_ticks } => QueryResult::QueueStats(
                self.state
                    .queues
                    .get(key)
                    .map(|queue| schedule::stats(queue, *now_ticks))
                    .unwrap_or_default(),
            ),
        }
    }
}
