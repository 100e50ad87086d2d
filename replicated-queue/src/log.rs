//! The replicated log as seen by the HTTP layer.
//!
//! Endpoints only need to propose commands, read behind a barrier and know
//! who leads. [`ReplicatedLog`] captures exactly that, so handlers can be
//! driven by a raft node ([`NodeHandle`]) or by a stand-in in tests.

use std::future::Future;
use std::time::Duration;

use crate::command::Command;
use crate::error::LogError;
use crate::interpreter::{ApplyOutcome, Query, QueryResult};
use crate::runtime::NodeHandle;

/// Leader as known by one node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LeaderInfo {
    /// `None` while an election is in progress.
    pub leader: Option<u64>,
    pub term: u64,
}

pub trait ReplicatedLog: Clone + Send + Sync + 'static {
    /// Appends `commands` as one entry, waits for commit and local apply.
    fn propose(
        &self,
        commands: Vec<Command>,
        wait: Duration,
    ) -> impl Future<Output = Result<Vec<ApplyOutcome>, LogError>> + Send;

    /// Read barrier followed by `query` against the applied state.
    fn read(
        &self,
        query: Query,
        wait: Duration,
    ) -> impl Future<Output = Result<QueryResult, LogError>> + Send;

    fn leader(&self) -> LeaderInfo;
}

impl ReplicatedLog for NodeHandle {
    async fn propose(
        &self,
        commands: Vec<Command>,
        wait: Duration,
    ) -> Result<Vec<ApplyOutcome>, LogError> {
        NodeHandle::propose(self, &commands, wait).await
    }

    async fn read(&self, query: Query, wait: Duration) -> Result<QueryResult, LogError> {
        NodeHandle::read(self, query, wait).await
    }

    fn leader(&self) -> LeaderInfo {
        NodeHandle::leader(self)
    }
}
