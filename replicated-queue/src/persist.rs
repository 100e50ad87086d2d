//! On-disk layout of a node's data directory.
//!
//! - `raft.log`: append-only stream of [`LogRecord`]s, each framed as a
//!   little-endian `u32` length followed by the bincode record.
//! - `snapshot.bin`: the latest [`SnapshotFile`], replaced atomically.
//!
//! Entries are never rewritten in place. When raft overwrites a suffix of its
//! log after a leader change, the new entries are appended and loading lets
//! the later record win.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use raft::prelude::{Entry, EntryType, HardState};
use serde::{Deserialize, Serialize};

const LOG_FILE: &str = "raft.log";
const SNAPSHOT_FILE: &str = "snapshot.bin";

/// One record in `raft.log`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogRecord {
    Entry {
        index: u64,
        term: u64,
        kind: u8,
        data: Vec<u8>,
        context: Vec<u8>,
    },
    HardState {
        term: u64,
        vote: u64,
        commit: u64,
    },
}

impl LogRecord {
    pub fn from_entry(entry: &Entry) -> Self {
        let kind = match entry.entry_type() {
            EntryType::EntryNormal => 0,
            EntryType::EntryConfChange => 1,
            EntryType::EntryConfChangeV2 => 2,
        };
        LogRecord::Entry {
            index: entry.index,
            term: entry.term,
            kind,
            data: entry.data.to_vec(),
            context: entry.context.to_vec(),
        }
    }

    pub fn from_hard_state(hs: &HardState) -> Self {
        LogRecord::HardState {
            term: hs.term,
            vote: hs.vote,
            commit: hs.commit,
        }
    }
}

fn to_entry(index: u64, term: u64, kind: u8, data: Vec<u8>, context: Vec<u8>) -> Entry {
    let mut entry = Entry::default();
    entry.index = index;
    entry.term = term;
    entry.set_entry_type(match kind {
        1 => EntryType::EntryConfChange,
        2 => EntryType::EntryConfChangeV2,
        _ => EntryType::EntryNormal,
    });
    entry.data = data.into();
    entry.context = context.into();
    entry
}

fn to_hard_state(term: u64, vote: u64, commit: u64) -> HardState {
    let mut hs = HardState::default();
    hs.term = term;
    hs.vote = vote;
    hs.commit = commit;
    hs
}

/// Latest checkpoint with the raft metadata needed to resume from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub index: u64,
    pub term: u64,
    pub voters: Vec<u64>,
    /// Encoded snapshot command.
    pub data: Vec<u8>,
}

/// Everything read back from a data directory at startup.
#[derive(Debug, Default)]
pub struct Recovered {
    pub snapshot: Option<SnapshotFile>,
    pub hard_state: Option<HardState>,
    /// Entries after the snapshot, contiguous and in index order.
    pub entries: Vec<Entry>,
}

pub struct DataDir {
    root: PathBuf,
    log: BufWriter<File>,
}

impl DataDir {
    /// Opens (creating if needed) a data directory and reads back its contents.
    pub fn open(root: impl Into<PathBuf>) -> Result<(Self, Recovered)> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create data dir {}", root.display()))?;

        let snapshot = read_snapshot(&root.join(SNAPSHOT_FILE))?;
        let floor = snapshot.as_ref().map_or(0, |s| s.index);
        let (hard_state, entries, valid_len) = read_log(&root.join(LOG_FILE), floor)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(root.join(LOG_FILE))
            .context("failed to open raft log")?;
        // Drop a torn trailing record so new appends start on a frame boundary.
        file.set_len(valid_len).context("failed to trim raft log")?;

        Ok((
            Self {
                root,
                log: BufWriter::new(file),
            },
            Recovered {
                snapshot,
                hard_state,
                entries,
            },
        ))
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    /// Appends records and syncs them to disk before returning.
    pub fn append(&mut self, records: &[LogRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        for record in records {
            write_frame(&mut self.log, record)?;
        }
        self.log.flush().context("failed to flush raft log")?;
        self.log
            .get_ref()
            .sync_data()
            .context("failed to sync raft log")
    }

    /// Writes a new snapshot, then rewrites the log keeping only `retained`
    /// (entries after the snapshot) and the current hard state.
    pub fn install_snapshot(
        &mut self,
        snapshot: &SnapshotFile,
        hard_state: &HardState,
        retained: &[Entry],
    ) -> Result<()> {
        let bytes = bincode::serialize(snapshot).context("failed to encode snapshot file")?;
        write_atomically(&self.root.join(SNAPSHOT_FILE), |out| {
            out.write_all(&bytes).map_err(Into::into)
        })?;

        write_atomically(&self.root.join(LOG_FILE), |out| {
            write_frame(out, &LogRecord::from_hard_state(hard_state))?;
            for entry in retained {
                write_frame(out, &LogRecord::from_entry(entry))?;
            }
            Ok(())
        })?;

        let file = OpenOptions::new()
            .append(true)
            .open(self.root.join(LOG_FILE))
            .context("failed to reopen raft log")?;
        self.log = BufWriter::new(file);
        Ok(())
    }
}

fn write_frame(out: &mut impl Write, record: &LogRecord) -> Result<()> {
    let bytes = bincode::serialize(record).context("failed to encode log record")?;
    let len = u32::try_from(bytes.len()).context("log record too large")?;
    out.write_all(&len.to_le_bytes())?;
    out.write_all(&bytes)?;
    Ok(())
}

fn write_atomically(
    path: &Path,
    write: impl FnOnce(&mut BufWriter<File>) -> Result<()>,
) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp).with_context(|| format!("failed to create {}", tmp.display()))?;
    let mut out = BufWriter::new(file);
    write(&mut out)?;
    out.flush()?;
    out.get_ref().sync_all()?;
    fs::rename(&tmp, path).with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

fn read_snapshot(path: &Path) -> Result<Option<SnapshotFile>> {
    match fs::read(path) {
        Ok(bytes) => {
            let snapshot = bincode::deserialize(&bytes)
                .with_context(|| format!("corrupt snapshot file {}", path.display()))?;
            Ok(Some(snapshot))
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
    }
}

/// Replays `raft.log`. Returns the last hard state, the surviving entries
/// above `floor`, and the byte length of the well-formed prefix.
fn read_log(path: &Path, floor: u64) -> Result<(Option<HardState>, Vec<Entry>, u64)> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err).with_context(|| format!("failed to read {}", path.display())),
    };

    let mut hard_state = None;
    let mut entries: Vec<Entry> = Vec::new();
    let mut rest = &bytes[..];
    let mut valid_len = 0u64;

    loop {
        let mut len_buf = [0u8; 4];
        if rest.read_exact(&mut len_buf).is_err() {
            break;
        }
        let len = u32::from_le_bytes(len_buf) as usize;
        if rest.len() < len {
            break;
        }
        let (frame, tail) = rest.split_at(len);
        rest = tail;
        let record: LogRecord = bincode::deserialize(frame)
            .with_context(|| format!("corrupt record at byte {valid_len} of raft log"))?;
        valid_len += 4 + len as u64;

        match record {
            LogRecord::HardState { term, vote, commit } => {
                hard_state = Some(to_hard_state(term, vote, commit));
            }
            LogRecord::Entry {
                index,
                term,
                kind,
                data,
                context,
            } => {
                if index <= floor {
                    continue;
                }
                // A rewritten index discards everything from it onward.
                if let Some(pos) = entries.iter().position(|e| e.index >= index) {
                    entries.truncate(pos);
                }
                if let Some(last) = entries.last() {
                    if last.index + 1 != index {
                        bail!(
                            "raft log gap: entry {} follows entry {}",
                            index,
                            last.index
                        );
                    }
                }
                entries.push(to_entry(index, term, kind, data, context));
            }
        }
    }

    Ok((hard_state, entries, valid_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
        to_entry(index, term, 0, data.to_vec(), vec![index as u8])
    }

    fn records(entries: &[Entry]) -> Vec<LogRecord> {
        entries.iter().map(LogRecord::from_entry).collect()
    }

    #[test]
    fn empty_dir_recovers_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (_, recovered) = DataDir::open(dir.path())?;
        assert!(recovered.snapshot.is_none());
        assert!(recovered.hard_state.is_none());
        assert!(recovered.entries.is_empty());
        Ok(())
    }

    #[test]
    fn entries_and_hard_state_survive_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (mut data, _) = DataDir::open(dir.path())?;
            data.append(&records(&[entry(1, 1, b"a"), entry(2, 1, b"b")]))?;
            data.append(&[LogRecord::from_hard_state(&to_hard_state(1, 1, 2))])?;
            data.append(&records(&[entry(3, 1, b"c")]))?;
        }
        let (_, recovered) = DataDir::open(dir.path())?;
        assert_eq!(recovered.hard_state, Some(to_hard_state(1, 1, 2)));
        let indexes: Vec<u64> = recovered.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, [1, 2, 3]);
        assert_eq!(recovered.entries[2].data.to_vec(), b"c");
        assert_eq!(recovered.entries[2].context.to_vec(), vec![3]);
        assert_eq!(recovered.entries[2].entry_type(), EntryType::EntryNormal);
        Ok(())
    }

    #[test]
    fn overwritten_suffix_is_replaced() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (mut data, _) = DataDir::open(dir.path())?;
            data.append(&records(&[entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 1, b"c")]))?;
            // New leader in term 2 rewrites from index 2.
            data.append(&records(&[entry(2, 2, b"B")]))?;
        }
        let (_, recovered) = DataDir::open(dir.path())?;
        let got: Vec<(u64, u64)> = recovered.entries.iter().map(|e| (e.index, e.term)).collect();
        assert_eq!(got, [(1, 1), (2, 2)]);
        Ok(())
    }

    #[test]
    fn torn_tail_is_dropped_and_appends_resume() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (mut data, _) = DataDir::open(dir.path())?;
            data.append(&records(&[entry(1, 1, b"a")]))?;
        }
        // Simulate a crash halfway through a frame.
        let mut file = OpenOptions::new().append(true).open(dir.path().join(LOG_FILE))?;
        file.write_all(&[200, 0, 0, 0, 1, 2])?;
        drop(file);

        {
            let (mut data, recovered) = DataDir::open(dir.path())?;
            assert_eq!(recovered.entries.len(), 1);
            data.append(&records(&[entry(2, 1, b"b")]))?;
        }
        let (_, recovered) = DataDir::open(dir.path())?;
        assert_eq!(recovered.entries.len(), 2);
        Ok(())
    }

    #[test]
    fn corrupt_record_is_fatal() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut file = File::create(dir.path().join(LOG_FILE))?;
        file.write_all(&[3, 0, 0, 0, 9, 9, 9])?;
        drop(file);
        assert!(DataDir::open(dir.path()).is_err());
        Ok(())
    }

    #[test]
    fn snapshot_truncates_log() -> Result<()> {
        let dir = tempfile::tempdir()?;
        {
            let (mut data, _) = DataDir::open(dir.path())?;
            let all = [entry(1, 1, b"a"), entry(2, 1, b"b"), entry(3, 2, b"c")];
            data.append(&records(&all))?;
            let snapshot = SnapshotFile {
                index: 2,
                term: 1,
                voters: vec![1, 2, 3],
                data: vec![5, 5],
            };
            data.install_snapshot(&snapshot, &to_hard_state(2, 1, 3), &all[2..])?;
            data.append(&records(&[entry(4, 2, b"d")]))?;
        }
        let (_, recovered) = DataDir::open(dir.path())?;
        let snapshot = recovered.snapshot.expect("snapshot");
        assert_eq!((snapshot.index, snapshot.term), (2, 1));
        assert_eq!(snapshot.voters, [1, 2, 3]);
        assert_eq!(recovered.hard_state, Some(to_hard_state(2, 1, 3)));
        let indexes: Vec<u64> = recovered.entries.iter().map(|e| e.index).collect();
        assert_eq!(indexes, [3, 4]);
        Ok(())
    }
}
