//! Core Raft node implementation.
//!
//! This module wraps the tikv/raft library to provide a simplified interface for
//! running a Raft consensus node. The main abstraction is [`RaftNode`], which combines
//! the raw Raft state machine with the command [`Interpreter`].

use anyhow::{bail, Context, Result};
use raft::prelude::{Config, Entry, EntryType, Message, RawNode, Snapshot};
use raft::{ReadState, StateRole};
use slog::{o, Logger};
use tracing::{debug, info};

use crate::command::decode_batch;
use crate::interpreter::{ApplyOutcome, Interpreter, Query, QueryResult};
use crate::persist::{DataDir, Recovered};
use crate::snapshot::{self, SnapshotBuilder};
use crate::storage::LogStore;

/// Creates a logger that discards all output.
///
/// The tikv/raft library requires a logger, but we handle logging at the application
/// level instead. This avoids duplicate/verbose Raft internals in our output.
fn silent_logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

/// Records details when an entry is applied to the state machine.
///
/// The runtime uses `context` to find the client waiting on the proposal and
/// hands it `outcomes`, one per command packed in the entry.
pub struct ApplyReport {
    pub index: u64,
    pub term: u64,
    pub context: Vec<u8>,
    pub outcomes: Vec<ApplyOutcome>,
}

/// Output from processing a Raft ready state.
///
/// Bundles both phases of Raft processing (Ready + LightReady) into a single
/// return value to simplify the caller's event loop.
pub struct ReadyBundle {
    pub messages: Vec<Message>,
    pub applied: Vec<ApplyReport>,
    /// Resolved read-index requests; serve them once `applied_index` reaches them.
    pub read_states: Vec<ReadState>,
}

/// Tuning that is not part of raft's own [`Config`].
#[derive(Debug, Clone, Copy)]
pub struct NodeOptions {
    /// Build a snapshot and compact the log after this many applied entries.
    pub snapshot_threshold: u64,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            snapshot_threshold: 1000,
        }
    }
}

/// A Raft consensus node driving the replicated queue state machine.
///
/// This wraps tikv/raft's `RawNode` and combines it with:
/// - **storage**: Raft's replicated log (entries, hard state, snapshots), in
///   memory or written through to a data directory
/// - **interpreter**: the application state machine
///
/// The node exposes a simplified interface: `propose` to submit commands,
/// `read_index` to request a read barrier, `step` to process incoming Raft
/// messages, `poll_ready` to advance state.
pub struct RaftNode {
    id: u64,
    voters: Vec<u64>,
    raw: RawNode<LogStore>,
    storage: LogStore,
    interpreter: Interpreter,
    applied_index: u64,
    applied_term: u64,
    /// Entry payloads applied since the last checkpoint, folded into the next.
    unsnapshotted: Vec<Vec<u8>>,
    options: NodeOptions,
}

impl RaftNode {
    /// Creates a new in-memory Raft node with the given ID and cluster configuration.
    ///
    /// # Raft timing configuration
    ///
    /// - `election_tick: 10`: Elections triggered after ~1 second of no leader heartbeats
    /// - `heartbeat_tick: 3`: Leader sends heartbeats every ~300ms
    /// - Assumes each `tick()` call happens every 100ms (set by runtime)
    pub fn new(id: u64, voters: &[u64], options: NodeOptions) -> Result<Self> {
        Self::with_storage(id, voters, LogStore::in_memory(voters), options)
    }

    /// Opens a node persisted under `data_dir`, restoring its last snapshot and
    /// letting raft replay every committed entry after it.
    pub fn open(
        id: u64,
        voters: &[u64],
        data_dir: DataDir,
        recovered: Recovered,
        options: NodeOptions,
    ) -> Result<Self> {
        let storage = LogStore::recover(data_dir, recovered, voters)?;
        Self::with_storage(id, voters, storage, options)
    }

    fn with_storage(
        id: u64,
        voters: &[u64],
        storage: LogStore,
        options: NodeOptions,
    ) -> Result<Self> {
        let (interpreter, applied_index, applied_term) = match storage.snapshot_data() {
            Some(data) => {
                let interpreter =
                    snapshot::restore(&data).context("failed to restore snapshot")?;
                let index = storage.snapshot_index();
                let term = raft::Storage::term(&storage, index)
                    .with_context(|| format!("failed to read term of snapshot at {index}"))?;
                (interpreter, index, term)
            }
            None => (Interpreter::new(), 0, 0),
        };

        let cfg = Config {
            id,
            election_tick: 10,
            heartbeat_tick: 3,
            max_inflight_msgs: 256,
            applied: applied_index,
            ..Default::default()
        };
        let logger = silent_logger();
        let raw = RawNode::new(&cfg, storage.clone(), &logger)
            .with_context(|| format!("failed to construct RawNode {id}"))?;
        if applied_index > 0 {
            info!(node = id, index = applied_index, "restored snapshot");
        }
        Ok(Self {
            id,
            voters: voters.to_vec(),
            raw,
            storage,
            interpreter,
            applied_index,
            applied_term,
            unsnapshotted: Vec::new(),
            options,
        })
    }

    /// Advances Raft's logical clock by one tick.
    pub fn tick(&mut self) {
        self.raw.tick();
    }

    /// Starts an election to become leader.
    pub fn campaign(&mut self) -> Result<()> {
        self.raw.campaign().context("campaign failed")
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Returns this node's current role (Follower, Candidate, or Leader).
    pub fn role(&self) -> StateRole {
        self.raw.raft.state
    }

    /// Returns the current leader's ID, or `None` if no leader is known.
    pub fn leader_id(&self) -> Option<u64> {
        match self.raw.raft.leader_id {
            raft::INVALID_ID => None,
            id => Some(id),
        }
    }

    /// Returns the current Raft term.
    pub fn term(&self) -> u64 {
        self.raw.raft.term
    }

    pub fn applied_index(&self) -> u64 {
        self.applied_index
    }

    /// Appends an already-encoded entry to the local log.
    ///
    /// Only a leader may propose. Success here only means "added to log", not
    /// "committed"; `poll_ready()` reports when the entry is applied, tagged
    /// with `context`.
    pub fn propose(&mut self, context: Vec<u8>, data: Vec<u8>) -> Result<()> {
        if self.role() != StateRole::Leader {
            bail!("node {} is not the leader", self.id);
        }
        self.raw.propose(context, data).context("propose failed")
    }

    /// Requests a read barrier. The matching [`ReadState`] arrives in a later
    /// `poll_ready()`.
    pub fn read_index(&mut self, context: Vec<u8>) {
        self.raw.read_index(context);
    }

    /// Processes a Raft message from another node.
    pub fn step(&mut self, msg: Message) -> Result<()> {
        self.raw.step(msg).context("step failed")
    }

    /// Answers a query from the applied state.
    pub fn query(&self, query: &Query) -> QueryResult {
        self.interpreter.query(query)
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    pub fn storage(&self) -> &LogStore {
        &self.storage
    }

    /// Checks if Raft has work to do, processes it, and returns results.
    ///
    /// # Processing flow
    ///
    /// **Phase 1 (Ready)**: persist hard state and new entries, install any
    /// received snapshot, apply committed entries, collect messages and read
    /// states.
    ///
    /// **Phase 2 (LightReady)**: record the advanced commit index, apply any
    /// further committed entries, collect messages.
    ///
    /// A checkpoint is taken afterwards if enough entries were applied.
    pub fn poll_ready(&mut self) -> Result<Option<ReadyBundle>> {
        if !self.raw.has_ready() {
            return Ok(None);
        }

        let mut ready = self.raw.ready();
        let mut applied = Vec::new();
        let mut outbound = Vec::new();

        // Phase 1: Persist durable state

        if !ready.snapshot().is_empty() {
            self.install_snapshot(ready.snapshot().clone())?;
        }

        if !ready.entries().is_empty() {
            self.storage.append(ready.entries())?;
        }

        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state.clone())?;
        }

        outbound.extend(ready.take_messages());
        let read_states = ready.take_read_states();
        applied.extend(self.apply_entries(ready.take_committed_entries())?);
        outbound.extend(ready.take_persisted_messages());

        // Phase 2: Continue processing after persistence acknowledgment

        let mut light_ready = self.raw.advance(ready);

        if let Some(commit) = light_ready.commit_index() {
            self.storage.set_commit(commit)?;
        }

        applied.extend(self.apply_entries(light_ready.take_committed_entries())?);
        outbound.extend(light_ready.take_messages());

        self.raw.advance_apply();
        self.maybe_snapshot()?;

        Ok(Some(ReadyBundle {
            messages: outbound,
            applied,
            read_states,
        }))
    }

    fn install_snapshot(&mut self, snapshot: Snapshot) -> Result<()> {
        let index = snapshot.get_metadata().index;
        let term = snapshot.get_metadata().term;
        let interpreter = snapshot::restore(&snapshot.data).context("received corrupt snapshot")?;
        self.storage.apply_snapshot(snapshot)?;
        self.interpreter = interpreter;
        self.applied_index = index;
        self.applied_term = term;
        self.unsnapshotted.clear();
        info!(node = self.id, index, term, "installed snapshot from leader");
        Ok(())
    }

    /// Applies committed entries to the state machine.
    ///
    /// Empty entries (the no-op a new leader appends) only advance the
    /// applied index. A payload that fails to decode is fatal: skipping it
    /// would let this node diverge from its peers.
    fn apply_entries(&mut self, entries: Vec<Entry>) -> Result<Vec<ApplyReport>> {
        let mut applied = Vec::new();
        for entry in entries {
            if entry.index <= self.applied_index {
                continue;
            }
            self.applied_index = entry.index;
            self.applied_term = entry.term;
            if entry.data.is_empty() || entry.get_entry_type() != EntryType::EntryNormal {
                continue;
            }

            let commands = decode_batch(&entry.data).with_context(|| {
                format!("failed to decode log entry {} (term {})", entry.index, entry.term)
            })?;
            let outcomes: Vec<ApplyOutcome> = commands
                .into_iter()
                .map(|command| self.interpreter.apply(command))
                .collect();
            debug!(
                node = self.id,
                index = entry.index,
                term = entry.term,
                commands = outcomes.len(),
                "applied entry"
            );
            self.unsnapshotted.push(entry.data.to_vec());
            applied.push(ApplyReport {
                index: entry.index,
                term: entry.term,
                context: entry.context.to_vec(),
                outcomes,
            });
        }
        Ok(applied)
    }

    /// Folds the entries applied since the last checkpoint into a new one and
    /// compacts the log, once the threshold is reached.
    fn maybe_snapshot(&mut self) -> Result<()> {
        let since = self.applied_index - self.storage.snapshot_index();
        if since < self.options.snapshot_threshold || self.applied_index == 0 {
            return Ok(());
        }

        let mut builder = match self.storage.snapshot_data() {
            Some(base) => SnapshotBuilder::from_snapshot(&base)?,
            None => SnapshotBuilder::new(),
        };
        for data in self.unsnapshotted.drain(..) {
            builder.apply_entry(&data)?;
        }
        let folded = builder.folded();
        let data = builder.build()?;
        self.storage
            .compact(self.applied_index, self.applied_term, &self.voters, data)?;
        info!(
            node = self.id,
            index = self.applied_index,
            folded,
            queued = self.interpreter.state().queued_elements(),
            "compacted log into snapshot"
        );
        Ok(())
    }
}
