//! Raft log storage for a node.
//!
//! [`LogStore`] keeps raft's entries and hard state in tikv's `MemStorage` and,
//! when the node has a data directory, writes every change through to disk
//! before raft is told it is persisted. The only thing `MemStorage` cannot do
//! for us is produce snapshots with real content, so the latest checkpoint is
//! held here and served from [`Storage::snapshot`].

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::{Mutex, RwLock};
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::storage::{GetEntriesContext, MemStorage, RaftState, Storage};
use raft::StorageError;

use crate::persist::{DataDir, LogRecord, Recovered, SnapshotFile};

#[derive(Clone)]
pub struct LogStore {
    mem: MemStorage,
    snapshot: Arc<RwLock<Snapshot>>,
    disk: Option<Arc<Mutex<DataDir>>>,
}

impl LogStore {
    /// Fresh in-memory storage for a cluster of `voters`.
    pub fn in_memory(voters: &[u64]) -> Self {
        Self {
            mem: MemStorage::new_with_conf_state(ConfState::from((voters.to_vec(), vec![]))),
            snapshot: Arc::new(RwLock::new(Snapshot::default())),
            disk: None,
        }
    }

    /// Storage backed by `data`, seeded from what was recovered from it.
    /// Falls back to `voters` when no snapshot recorded the membership.
    pub fn recover(data: DataDir, recovered: Recovered, voters: &[u64]) -> Result<Self> {
        let Recovered {
            snapshot,
            hard_state,
            entries,
        } = recovered;

        let store = match snapshot {
            Some(file) => {
                let store = Self {
                    mem: MemStorage::new(),
                    snapshot: Arc::new(RwLock::new(Snapshot::default())),
                    disk: None,
                };
                let snapshot = to_raft_snapshot(&file);
                store
                    .mem
                    .wl()
                    .apply_snapshot(snapshot.clone())
                    .context("failed to load snapshot into raft storage")?;
                *store.snapshot.write() = snapshot;
                store
            }
            None => Self::in_memory(voters),
        };

        if !entries.is_empty() {
            store
                .mem
                .wl()
                .append(&entries)
                .context("failed to load raft log entries")?;
        }
        if let Some(hs) = hard_state {
            let mut core = store.mem.wl();
            // A snapshot may be ahead of the last persisted commit.
            let commit = hs.commit.max(core.hard_state().commit);
            let mut hs = hs;
            hs.commit = commit;
            core.set_hardstate(hs);
        }

        Ok(Self {
            disk: Some(Arc::new(Mutex::new(data))),
            ..store
        })
    }

    /// Index of the latest checkpoint, 0 if none.
    pub fn snapshot_index(&self) -> u64 {
        self.snapshot.read().get_metadata().index
    }

    /// Encoded state of the latest checkpoint, if any.
    pub fn snapshot_data(&self) -> Option<Vec<u8>> {
        let snapshot = self.snapshot.read();
        (!snapshot.is_empty()).then(|| snapshot.data.to_vec())
    }

    pub fn hard_state(&self) -> HardState {
        self.mem.rl().hard_state().clone()
    }

    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if let Some(disk) = &self.disk {
            let records: Vec<LogRecord> = entries.iter().map(LogRecord::from_entry).collect();
            disk.lock().append(&records)?;
        }
        self.mem
            .wl()
            .append(entries)
            .context("append entries failed")
    }

    pub fn set_hard_state(&self, hs: HardState) -> Result<()> {
        if let Some(disk) = &self.disk {
            disk.lock().append(&[LogRecord::from_hard_state(&hs)])?;
        }
        self.mem.wl().set_hardstate(hs);
        Ok(())
    }

    pub fn set_commit(&self, commit: u64) -> Result<()> {
        let mut hs = self.hard_state();
        hs.commit = commit;
        self.set_hard_state(hs)
    }

    /// Installs a snapshot received from the leader, replacing the log.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        let meta = snapshot.get_metadata();
        if let Some(disk) = &self.disk {
            let file = SnapshotFile {
                index: meta.index,
                term: meta.term,
                voters: meta.get_conf_state().voters.clone(),
                data: snapshot.data.to_vec(),
            };
            let mut hs = self.hard_state();
            hs.commit = hs.commit.max(meta.index);
            hs.term = hs.term.max(meta.term);
            disk.lock().install_snapshot(&file, &hs, &[])?;
        }
        self.mem
            .wl()
            .apply_snapshot(snapshot.clone())
            .context("apply snapshot failed")?;
        *self.snapshot.write() = snapshot;
        Ok(())
    }

    /// Records a locally built checkpoint at `index` and discards the log
    /// before it.
    pub fn compact(&self, index: u64, term: u64, voters: &[u64], data: Vec<u8>) -> Result<()> {
        let mut snapshot = Snapshot::default();
        snapshot.data = data.clone().into();
        let meta = snapshot.mut_metadata();
        meta.index = index;
        meta.term = term;
        meta.set_conf_state(ConfState::from((voters.to_vec(), vec![])));

        if let Some(disk) = &self.disk {
            let retained = self.entries_after(index)?;
            let file = SnapshotFile {
                index,
                term,
                voters: voters.to_vec(),
                data,
            };
            disk.lock()
                .install_snapshot(&file, &self.hard_state(), &retained)?;
        }
        *self.snapshot.write() = snapshot;
        self.mem
            .wl()
            .compact(index)
            .context("failed to compact raft log")
    }

    fn entries_after(&self, index: u64) -> Result<Vec<Entry>> {
        let last = self.mem.last_index()?;
        if last <= index {
            return Ok(Vec::new());
        }
        let entries = self
            .mem
            .entries(index + 1, last + 1, None::<u64>, GetEntriesContext::empty(false))?;
        Ok(entries)
    }
}

fn to_raft_snapshot(file: &SnapshotFile) -> Snapshot {
    let mut snapshot = Snapshot::default();
    snapshot.data = file.data.clone().into();
    let meta = snapshot.mut_metadata();
    meta.index = file.index;
    meta.term = file.term;
    meta.set_conf_state(ConfState::from((file.voters.clone(), vec![])));
    snapshot
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        self.mem.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        self.mem.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        self.mem.term(idx)
    }

    fn first_index(&self) -> raft::Result<u64> {
        self.mem.first_index()
    }

    fn last_index(&self) -> raft::Result<u64> {
        self.mem.last_index()
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let snapshot = self.snapshot.read();
        if snapshot.is_empty() || snapshot.get_metadata().index < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(snapshot.clone())
    }
}
