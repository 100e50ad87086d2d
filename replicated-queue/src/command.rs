//! Commands that flow through the Raft replicated log.
//!
//! Each variant has a stable id (its declaration index, which bincode writes as
//! a little-endian `u32` tag ahead of the fields). Integers are fixed-width
//! little-endian and strings, blobs, lists and maps carry a little-endian `u64`
//! length prefix, so an encoded command is self-delimiting and several of them
//! can be packed back to back into one log entry.
//!
//! Never reorder the variants: the tag is part of the persisted log format.

use std::collections::BTreeMap;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::state::ReplicatedState;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    SetKeyValue {
        key: String,
        value: Vec<u8>,
    },
    SetHashset {
        key: String,
        fields: BTreeMap<String, String>,
    },
    QueuePush {
        key: String,
        id: String,
        now_ticks: i64,
        retry_timeout_seconds: i32,
        retry_delays_seconds: Vec<i32>,
        retryable_status_codes: Vec<i32>,
        value: Vec<u8>,
    },
    QueuePop {
        key: String,
        count: u32,
        now_ticks: i64,
    },
    QueueOutcome {
        key: String,
        id: String,
        now_ticks: i64,
        outcome_code: i32,
    },
    Snapshot(ReplicatedState),
}

impl Command {
    pub const SET_KEY_VALUE: u32 = 0;
    pub const SET_HASHSET: u32 = 1;
    pub const QUEUE_PUSH: u32 = 2;
    pub const QUEUE_POP: u32 = 3;
    pub const QUEUE_OUTCOME: u32 = 4;
    pub const SNAPSHOT: u32 = 5;

    /// Stable wire id of this command kind.
    pub fn id(&self) -> u32 {
        match self {
            Command::SetKeyValue { .. } => Self::SET_KEY_VALUE,
            Command::SetHashset { .. } => Self::SET_HASHSET,
            Command::QueuePush { .. } => Self::QUEUE_PUSH,
            Command::QueuePop { .. } => Self::QUEUE_POP,
            Command::QueueOutcome { .. } => Self::QUEUE_OUTCOME,
            Command::Snapshot(_) => Self::SNAPSHOT,
        }
    }

    /// Exact number of bytes `encode` will produce.
    pub fn encoded_len(&self) -> Result<u64, CodecError> {
        Ok(wire_options().serialized_size(self)?)
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        Ok(wire_options().serialize(self)?)
    }

    /// Decodes exactly one command. Trailing bytes are an error; use
    /// [`decode_batch`] for packed entries.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut commands = decode_batch(bytes)?;
        match commands.len() {
            1 => Ok(commands.remove(0)),
            n => Err(CodecError::Bincode(Box::new(bincode::ErrorKind::Custom(
                format!("expected one command, found {n}"),
            )))),
        }
    }
}

/// Packs commands back to back into one buffer.
pub fn encode_batch(commands: &[Command]) -> Result<Vec<u8>, CodecError> {
    let mut capacity = 0;
    for command in commands {
        capacity += command.encoded_len()?;
    }
    let mut buf = Vec::with_capacity(capacity as usize);
    for command in commands {
        wire_options().serialize_into(&mut buf, command)?;
    }
    Ok(buf)
}

/// Splits a packed buffer back into its commands, in order.
///
/// Every length prefix is checked against the bytes that remain, so a corrupt
/// buffer fails with an error instead of a huge allocation.
pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Command>, CodecError> {
    let mut rest = bytes;
    let mut commands = Vec::new();
    while !rest.is_empty() {
        let limit = rest.len() as u64;
        commands.push(wire_options().with_limit(limit).deserialize_from(&mut rest)?);
    }
    Ok(commands)
}

/// Legacy bincode layout: fixed-width little-endian integers, trailing bytes
/// left for the next command in a batch.
fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
}
