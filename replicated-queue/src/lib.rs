//! Raft-replicated, retry-aware work queue and key/value store.
//!
//! Multiple nodes agree on one ordered history of mutations through the Raft
//! consensus algorithm (tikv/raft-rs). Each node applies that history through
//! a deterministic interpreter, so every node converges on the same queues,
//! key/values and hashsets, and any node can serve linearizable reads.
//!
//! # Architecture
//!
//! - **Worker thread**: Drives the Raft state machine, applies committed entries,
//!   answers reads once their read barrier is satisfied
//! - **Network listener thread**: Accepts incoming Raft messages from peers
//! - **HTTP server**: axum handlers that turn requests into commands and await
//!   the worker through [`runtime::NodeHandle`]
//!
//! The worker is the only owner of the interpreter, so commands apply
//! strictly in log order with no locks on the replicated state.
//!
//! # Modules
//!
//! - [`command`]: Binary command encoding, the unit of replication
//! - [`state`]: Replicated data model
//! - [`schedule`]: Queue retry and timeout scheduling
//! - [`interpreter`]: Deterministic command application and queries
//! - [`snapshot`]: Checkpoint building and restore
//! - [`persist`], [`storage`]: On-disk log and the raft `Storage` over it
//! - [`node`]: Core Raft node wrapping tikv/raft library
//! - [`runtime`]: Worker loop, network handling, node spawning
//! - [`log`]: The replicated log interface used by the endpoints
//! - [`endpoints`]: HTTP command endpoints
//! - [`config`]: Command line and environment configuration

pub mod clock;
pub mod command;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod interpreter;
pub mod log;
pub mod node;
pub mod persist;
pub mod runtime;
pub mod schedule;
pub mod snapshot;
pub mod state;
pub mod storage;
