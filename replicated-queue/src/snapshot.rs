//! Snapshot building and restore.
//!
//! A snapshot is an encoded [`Command::Snapshot`] holding the full state, the
//! same layout the log uses, so restoring one is just applying it to a fresh
//! interpreter.

use crate::command::{decode_batch, Command};
use crate::error::CodecError;
use crate::interpreter::Interpreter;
use crate::state::ReplicatedState;

/// Folds committed log entries into a checkpoint.
///
/// Start from an empty state or from the previous checkpoint, feed every entry
/// committed after it in log order, then [`build`](Self::build).
#[derive(Debug, Default)]
pub struct SnapshotBuilder {
    interpreter: Interpreter,
    folded: u64,
}

impl SnapshotBuilder {
    /// Builder over an empty state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder continuing from an encoded checkpoint.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(Self {
            interpreter: restore(bytes)?,
            folded: 0,
        })
    }

    /// Applies one log entry's packed commands.
    pub fn apply_entry(&mut self, data: &[u8]) -> Result<(), CodecError> {
        for command in decode_batch(data)? {
            self.interpreter.apply(command);
        }
        self.folded += 1;
        Ok(())
    }

    /// Number of entries folded since construction.
    pub fn folded(&self) -> u64 {
        self.folded
    }

    pub fn build(self) -> Result<Vec<u8>, CodecError> {
        encode_state(self.interpreter.into_state())
    }
}

/// Encodes a state as a snapshot command.
pub fn encode_state(state: ReplicatedState) -> Result<Vec<u8>, CodecError> {
    Command::Snapshot(state).encode()
}

/// Decodes a checkpoint into a fresh interpreter.
pub fn restore(bytes: &[u8]) -> Result<Interpreter, CodecError> {
    match Command::decode(bytes)? {
        command @ Command::Snapshot(_) => {
            let mut interpreter = Interpreter::new();
            interpreter.apply(command);
            Ok(interpreter)
        }
        other => Err(CodecError::NotASnapshot(other.id())),
    }
}
