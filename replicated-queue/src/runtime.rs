//! Worker runtime and network handling for Raft nodes.
//!
//! This module orchestrates the threading model and network communication:
//!
//! - **Worker thread**: Runs the Raft event loop, proposes commands, answers reads
//! - **Network listener thread**: Accepts TCP connections from peers
//! - **Connection handler threads**: Short-lived threads that read messages and forward to worker
//!
//! The worker waits on crossbeam channels, so the node and its interpreter
//! are only ever touched from one thread. Async callers talk to it through
//! [`NodeHandle`], which pairs each request with a `tokio` oneshot reply.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use prost::Message as ProstMessage;
use raft::prelude::Message;
use raft::{ReadState, StateRole};
use tokio::sync::{oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::command::{encode_batch, Command};
use crate::error::LogError;
use crate::interpreter::{ApplyOutcome, Query, QueryResult};
use crate::log::LeaderInfo;
use crate::node::{ApplyReport, NodeOptions, RaftNode};
use crate::persist::DataDir;

/// Raft logical clock interval.
///
/// The worker calls `node.tick()` every 100ms, which drives Raft's timeout logic:
/// - Heartbeat timeout: 3 ticks = 300ms
/// - Election timeout: 10 ticks = 1000ms
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// Largest raft message frame accepted from a peer.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Configuration for spawning a Raft node.
///
/// Specifies the node's identity and how to reach all cluster members.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's unique ID (must appear in `peers`)
    pub id: u64,
    /// Address to bind for incoming Raft messages (e.g., "127.0.0.1:7101")
    pub listen_addr: String,
    /// Map of node ID to raft transport address for all cluster members (including self)
    pub peers: HashMap<u64, String>,
    /// Persist the log here; memory only when `None`.
    pub data_dir: Option<PathBuf>,
    pub snapshot_threshold: u64,
}

/// Point-in-time view of a node, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: StateRole,
    pub leader: Option<u64>,
    pub term: u64,
    pub applied_index: u64,
    pub snapshot_index: u64,
}

/// Handle for sending requests to a running Raft node.
///
/// The worker thread owns the actual `RaftNode` and processes requests via
/// a channel. Handles are cheap to clone and safe to use from async code:
/// submitting never blocks, and replies are awaited under the caller's
/// timeout.
#[derive(Clone)]
pub struct NodeHandle {
    id: u64,
    request_tx: Sender<ClientRequest>,
    leader_rx: watch::Receiver<LeaderInfo>,
}

impl NodeHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Proposes `commands` as one log entry and waits until this node has
    /// applied it, returning one outcome per command.
    ///
    /// # Errors
    /// - [`LogError::NotLeader`] if this node cannot accept writes
    /// - [`LogError::Timeout`] if the entry is not applied within `wait`;
    ///   the proposal may still commit later
    /// - [`LogError::LeadershipLost`] if leadership changed while waiting
    pub async fn propose(
        &self,
        commands: &[Command],
        wait: Duration,
    ) -> Result<Vec<ApplyOutcome>, LogError> {
        let data = encode_batch(commands).map_err(|err| LogError::Rejected(err.to_string()))?;
        let (respond_to, reply) = oneshot::channel();
        self.send(ClientRequest::Propose { data, respond_to })?;
        await_reply(reply, wait).await?
    }

    /// Answers `query` once every write committed before the call is visible
    /// on this node.
    pub async fn read(&self, query: Query, wait: Duration) -> Result<QueryResult, LogError> {
        let (respond_to, reply) = oneshot::channel();
        self.send(ClientRequest::Read { query, respond_to })?;
        await_reply(reply, wait).await?
    }

    /// Retrieves the node's current status (role, leader, indexes).
    pub async fn status(&self) -> Result<NodeStatus, LogError> {
        let (respond_to, reply) = oneshot::channel();
        self.send(ClientRequest::Status { respond_to })?;
        reply.await.map_err(|_| LogError::Shutdown)
    }

    /// Forces this node to start an election campaign.
    ///
    /// The election may succeed or fail depending on votes from peers; watch
    /// [`subscribe_leader`](Self::subscribe_leader) for the result.
    pub async fn campaign(&self) -> Result<(), LogError> {
        let (respond_to, reply) = oneshot::channel();
        self.send(ClientRequest::Campaign { respond_to })?;
        reply.await.map_err(|_| LogError::Shutdown)?
    }

    /// The leader as last observed by the worker.
    pub fn leader(&self) -> LeaderInfo {
        *self.leader_rx.borrow()
    }

    /// Receiver that changes whenever the known leader or term changes.
    pub fn subscribe_leader(&self) -> watch::Receiver<LeaderInfo> {
        self.leader_rx.clone()
    }

    /// Signals the worker to shut down. Requests still waiting fail with
    /// [`LogError::Shutdown`].
    pub fn shutdown(&self) {
        let _ = self.request_tx.send(ClientRequest::Shutdown);
    }

    fn send(&self, request: ClientRequest) -> Result<(), LogError> {
        self.request_tx
            .send(request)
            .map_err(|_| LogError::Shutdown)
    }
}

async fn await_reply<T>(reply: oneshot::Receiver<T>, wait: Duration) -> Result<T, LogError> {
    match tokio::time::timeout(wait, reply).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(LogError::Shutdown),
        Err(_) => Err(LogError::Timeout(wait)),
    }
}

/// Requests sent from handles to the worker thread.
enum ClientRequest {
    Propose {
        data: Vec<u8>,
        respond_to: oneshot::Sender<Result<Vec<ApplyOutcome>, LogError>>,
    },
    Read {
        query: Query,
        respond_to: oneshot::Sender<Result<QueryResult, LogError>>,
    },
    Status {
        respond_to: oneshot::Sender<NodeStatus>,
    },
    Campaign {
        respond_to: oneshot::Sender<Result<(), LogError>>,
    },
    Shutdown,
}

/// A read waiting for its barrier.
///
/// `index` is filled in once raft confirms the read index; the query is
/// answered when the node has applied at least that far.
struct PendingRead {
    context: Vec<u8>,
    query: Query,
    index: Option<u64>,
    respond_to: oneshot::Sender<Result<QueryResult, LogError>>,
}

/// Raft context attached to proposals and read requests.
///
/// Written as three little-endian `u64`s: the proposing node's id, the
/// worker's incarnation and a request id. The incarnation is drawn at random
/// whenever a worker starts, so an entry proposed before a restart never
/// matches a request issued after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct RequestContext {
    node_id: u64,
    incarnation: u64,
    request_id: u64,
}

impl RequestContext {
    const LEN: usize = 24;

    fn encode(&self) -> Vec<u8> {
        let mut context = Vec::with_capacity(Self::LEN);
        context.extend_from_slice(&self.node_id.to_le_bytes());
        context.extend_from_slice(&self.incarnation.to_le_bytes());
        context.extend_from_slice(&self.request_id.to_le_bytes());
        context
    }

    fn parse(context: &[u8]) -> Option<Self> {
        if context.len() != Self::LEN {
            return None;
        }
        let word = |at: usize| -> Option<u64> {
            Some(u64::from_le_bytes(context.get(at..at + 8)?.try_into().ok()?))
        };
        Some(Self {
            node_id: word(0)?,
            incarnation: word(8)?,
            request_id: word(16)?,
        })
    }
}

/// Spawns a Raft node and returns a handle to interact with it.
///
/// Binds the transport listener, restores the node from `config.data_dir`
/// when one is set, then starts the worker thread.
///
/// # Errors
///
/// Returns error if:
/// - `config.id` is not present in `config.peers`
/// - Network listener fails to bind to `config.listen_addr`
/// - The data directory cannot be read or holds a corrupt log or snapshot
pub fn spawn_node(config: NodeConfig) -> Result<NodeHandle> {
    let voters: Vec<u64> = {
        let mut v: Vec<u64> = config.peers.keys().copied().collect();
        v.sort_unstable();
        v
    };
    if !config.peers.contains_key(&config.id) {
        return Err(anyhow!(
            "listen node id {} missing from peers map",
            config.id
        ));
    }

    let options = NodeOptions {
        snapshot_threshold: config.snapshot_threshold,
    };
    let node = match &config.data_dir {
        Some(dir) => {
            let (data, recovered) = DataDir::open(dir)?;
            info!(
                node = config.id,
                dir = %data.path().display(),
                entries = recovered.entries.len(),
                "opened data directory"
            );
            RaftNode::open(config.id, &voters, data, recovered, options)?
        }
        None => RaftNode::new(config.id, &voters, options)?,
    };

    let (client_tx, client_rx) = unbounded();
    let (network_tx, network_rx) = unbounded();
    let (leader_tx, leader_rx) = watch::channel(LeaderInfo::default());

    let listener = TcpListener::bind(&config.listen_addr)
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    spawn_network_listener(listener, config.listen_addr.clone(), network_tx)?;

    let id = config.id;
    thread::Builder::new()
        .name(format!("raft-worker-{id}"))
        .spawn(move || {
            if let Err(err) = Worker::new(node, config.peers, client_rx, network_rx, leader_tx).run() {
                error!(node = id, "raft worker crashed: {err:?}");
            }
        })
        .context("failed to spawn raft worker")?;

    Ok(NodeHandle {
        id,
        request_tx: client_tx,
        leader_rx,
    })
}

/// The worker that runs the Raft event loop.
///
/// Owns the RaftNode and processes three types of events:
/// 1. **Client requests** from [`NodeHandle`]s
/// 2. **Network messages** (Raft protocol) from peers
/// 3. **Tick events** (every 100ms) to drive Raft timeouts and re-issue
///    unresolved reads
struct Worker {
    node: RaftNode,
    peers: HashMap<u64, String>,
    client_rx: Receiver<ClientRequest>,
    network_rx: Receiver<Message>,
    leader_tx: watch::Sender<LeaderInfo>,
    pending_proposals:
        HashMap<RequestContext, oneshot::Sender<Result<Vec<ApplyOutcome>, LogError>>>,
    pending_reads: Vec<PendingRead>,
    incarnation: u64,
    next_request: u64,
    last_role: StateRole,
}

impl Worker {
    fn new(
        node: RaftNode,
        peers: HashMap<u64, String>,
        client_rx: Receiver<ClientRequest>,
        network_rx: Receiver<Message>,
        leader_tx: watch::Sender<LeaderInfo>,
    ) -> Self {
        let last_role = node.role();
        Self {
            node,
            peers,
            client_rx,
            network_rx,
            leader_tx,
            pending_proposals: HashMap::new(),
            pending_reads: Vec::new(),
            incarnation: rand::random(),
            next_request: 0,
            last_role,
        }
    }

    /// Runs the main event loop until shutdown.
    ///
    /// Each iteration:
    /// 1. Wait (with timeout) for client request or network message
    /// 2. Check if it's time to tick (every 100ms)
    /// 3. Process any Ready state from Raft
    /// 4. Publish role and leader changes
    fn run(&mut self) -> Result<()> {
        let mut last_tick = Instant::now();
        loop {
            let timeout = TICK_INTERVAL
                .checked_sub(last_tick.elapsed())
                .unwrap_or(Duration::from_secs(0));

            crossbeam_channel::select! {
                recv(self.client_rx) -> req => {
                    match req {
                        Ok(req) => {
                            if !self.handle_client_request(req)? {
                                break;
                            }
                        }
                        Err(_) => break,
                    }
                }
                recv(self.network_rx) -> msg => {
                    match msg {
                        Ok(msg) => {
                            if let Err(err) = self.node.step(msg) {
                                debug!(node = self.node.id(), "dropped raft message: {err:#}");
                            }
                        }
                        Err(_) => break,
                    }
                }
                default(timeout) => {}
            }

            if last_tick.elapsed() >= TICK_INTERVAL {
                self.node.tick();
                self.retry_reads();
                last_tick = Instant::now();
            }

            self.process_ready()?;
            self.observe_leadership();
        }

        info!(node = self.node.id(), "raft worker stopped");
        Ok(())
    }

    /// Handles a request from a [`NodeHandle`].
    ///
    /// Returns `false` if shutdown was requested, `true` otherwise.
    fn handle_client_request(&mut self, req: ClientRequest) -> Result<bool> {
        match req {
            ClientRequest::Propose { data, respond_to } => {
                if self.node.role() != StateRole::Leader {
                    let _ = respond_to.send(Err(LogError::NotLeader {
                        leader: self.node.leader_id(),
                    }));
                    return Ok(true);
                }
                let context = self.next_context();
                match self.node.propose(context.encode(), data) {
                    Ok(()) => {
                        self.pending_proposals.insert(context, respond_to);
                    }
                    Err(err) => {
                        let _ = respond_to.send(Err(LogError::Rejected(format!("{err:#}"))));
                    }
                }
            }
            ClientRequest::Read { query, respond_to } => {
                if self.node.leader_id().is_none() {
                    let _ = respond_to.send(Err(LogError::NotLeader { leader: None }));
                    return Ok(true);
                }
                let context = self.next_context().encode();
                self.node.read_index(context.clone());
                self.pending_reads.push(PendingRead {
                    context,
                    query,
                    index: None,
                    respond_to,
                });
            }
            ClientRequest::Status { respond_to } => {
                let status = NodeStatus {
                    node_id: self.node.id(),
                    role: self.node.role(),
                    leader: self.node.leader_id(),
                    term: self.node.term(),
                    applied_index: self.node.applied_index(),
                    snapshot_index: self.node.storage().snapshot_index(),
                };
                let _ = respond_to.send(status);
            }
            ClientRequest::Campaign { respond_to } => {
                let result = self
                    .node
                    .campaign()
                    .map_err(|err| LogError::Rejected(format!("{err:#}")));
                if result.is_ok() {
                    info!(node = self.node.id(), role = ?self.node.role(), "campaign initiated");
                }
                let _ = respond_to.send(result);
            }
            ClientRequest::Shutdown => return Ok(false),
        }
        Ok(true)
    }

    fn next_context(&mut self) -> RequestContext {
        self.next_request += 1;
        RequestContext {
            node_id: self.node.id(),
            incarnation: self.incarnation,
            request_id: self.next_request,
        }
    }

    /// Drains all ready state from Raft and processes it.
    ///
    /// Raft may produce multiple Ready batches in quick succession
    /// (e.g., processing a burst of incoming messages). We loop until
    /// `poll_ready()` returns None to ensure we're fully caught up.
    fn process_ready(&mut self) -> Result<()> {
        while let Some(bundle) = self.node.poll_ready()? {
            for msg in bundle.messages {
                self.dispatch_message(msg)?;
            }
            for report in bundle.applied {
                self.notify_proposer(report);
            }
            for read_state in bundle.read_states {
                self.resolve_read(read_state);
            }
            self.serve_reads();
        }
        Ok(())
    }

    /// Sends a Raft message to its destination.
    ///
    /// Messages addressed to this node are fed back into `node.step()`.
    /// Messages for other nodes are sent over the network.
    fn dispatch_message(&mut self, msg: Message) -> Result<()> {
        if msg.to == self.node.id() {
            self.node.step(msg)?;
            return Ok(());
        }

        let to = msg.to;
        let Some(addr) = self.peers.get(&to) else {
            warn!(node = self.node.id(), peer = to, "no address for peer, dropping message");
            return Ok(());
        };
        send_message(addr, &msg);
        Ok(())
    }

    /// Hands the outcomes of an applied entry to the client that proposed it.
    ///
    /// Entries proposed by other nodes or by an earlier run of this one, or
    /// whose client gave up waiting, have nobody to notify.
    fn notify_proposer(&mut self, report: ApplyReport) {
        let Some(context) = RequestContext::parse(&report.context) else {
            return;
        };
        if context.node_id != self.node.id() {
            return;
        }
        if let Some(respond_to) = self.pending_proposals.remove(&context) {
            let _ = respond_to.send(Ok(report.outcomes));
        }
    }

    fn resolve_read(&mut self, read_state: ReadState) {
        if let Some(pending) = self
            .pending_reads
            .iter_mut()
            .find(|pending| pending.context == read_state.request_ctx)
        {
            pending.index.get_or_insert(read_state.index);
        }
    }

    /// Answers every read whose barrier the applied state has reached.
    fn serve_reads(&mut self) {
        let applied = self.node.applied_index();
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_reads)
            .into_iter()
            .partition(|pending| pending.index.is_some_and(|index| index <= applied));
        self.pending_reads = waiting;
        for pending in ready {
            let _ = pending.respond_to.send(Ok(self.node.query(&pending.query)));
        }
    }

    /// Raft drops read-index requests it cannot serve yet (no leader, or a
    /// new leader that has not committed in its term), so unresolved reads
    /// are issued again on every tick. Reads whose caller went away are
    /// discarded.
    fn retry_reads(&mut self) {
        self.pending_reads
            .retain(|pending| !pending.respond_to.is_closed());
        let unresolved: Vec<Vec<u8>> = self
            .pending_reads
            .iter()
            .filter(|pending| pending.index.is_none())
            .map(|pending| pending.context.clone())
            .collect();
        for context in unresolved {
            self.node.read_index(context);
        }
    }

    /// Logs role changes, fails proposals stranded by a lost leadership and
    /// publishes the current leader.
    fn observe_leadership(&mut self) {
        let current = self.node.role();
        if current != self.last_role {
            info!(
                node = self.node.id(),
                from = ?self.last_role,
                to = ?current,
                leader = ?self.node.leader_id(),
                term = self.node.term(),
                "role changed"
            );
            if self.last_role == StateRole::Leader && !self.pending_proposals.is_empty() {
                warn!(
                    node = self.node.id(),
                    pending = self.pending_proposals.len(),
                    "leadership lost, failing pending proposals"
                );
                for (_, respond_to) in self.pending_proposals.drain() {
                    let _ = respond_to.send(Err(LogError::LeadershipLost));
                }
            }
            self.last_role = current;
        }

        let info = LeaderInfo {
            leader: self.node.leader_id(),
            term: self.node.term(),
        };
        self.leader_tx.send_if_modified(|published| {
            if *published == info {
                return false;
            }
            *published = info;
            true
        });
    }
}

/// Spawns a background thread that accepts incoming Raft messages.
///
/// Each connection gets a short-lived handler thread that reads one message
/// and forwards it to the worker via `tx`.
fn spawn_network_listener(listener: TcpListener, addr: String, tx: Sender<Message>) -> Result<()> {
    thread::Builder::new()
        .name(format!("raft-net-listener-{addr}"))
        .spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let tx = tx.clone();
                        thread::spawn(move || {
                            if let Err(err) = handle_connection(stream, tx) {
                                debug!("connection error: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        warn!(%addr, "accept error: {err}");
                    }
                }
            }
        })
        .map(|_| ())
        .context("failed to spawn network listener")
}

/// Reads a single Raft message from a TCP connection and forwards to the worker.
///
/// # Protocol
///
/// Messages are length-prefixed:
/// - 4 bytes: message length (big-endian u32, at most [`MAX_FRAME_LEN`])
/// - N bytes: protobuf-encoded Message
fn handle_connection(mut stream: TcpStream, tx: Sender<Message>) -> Result<()> {
    let msg = read_frame(&mut stream)?;
    tx.send(msg)
        .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "worker gone"))?;
    Ok(())
}

fn read_frame(reader: &mut impl Read) -> io::Result<Message> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Message::decode(&buf[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Sends a Raft message to a peer over a fresh connection.
///
/// Failures are logged and the message dropped; raft retransmits.
fn send_message(addr: &str, msg: &Message) {
    let bytes = msg.encode_to_vec();
    if let Err(err) = try_send(addr, &bytes) {
        debug!(%addr, "failed to send raft message: {err}");
    }
}

/// Opens a connection, writes length prefix + message, closes connection.
fn try_send(addr: &str, bytes: &[u8]) -> io::Result<()> {
    let mut stream = TcpStream::connect(addr)?;
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes())?;
    stream.write_all(bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_round_trips_node_incarnation_and_request() {
        let context = RequestContext {
            node_id: 3,
            incarnation: 0xdead_beef,
            request_id: 42,
        };
        let bytes = context.encode();
        assert_eq!(bytes.len(), RequestContext::LEN);
        assert_eq!(&bytes[..8], &3u64.to_le_bytes());
        assert_eq!(RequestContext::parse(&bytes), Some(context));
    }

    #[test]
    fn malformed_context_is_ignored() {
        assert_eq!(RequestContext::parse(&[]), None);
        assert_eq!(RequestContext::parse(&[1; 16]), None);
        assert_eq!(RequestContext::parse(&[1; 25]), None);
    }

    fn idle_worker() -> Worker {
        let node = RaftNode::new(1, &[1], NodeOptions::default()).expect("node");
        let (_client_tx, client_rx) = unbounded();
        let (_network_tx, network_rx) = unbounded();
        let (leader_tx, _leader_rx) = watch::channel(LeaderInfo::default());
        Worker::new(node, HashMap::new(), client_rx, network_rx, leader_tx)
    }

    fn applied(context: RequestContext) -> ApplyReport {
        ApplyReport {
            index: 7,
            term: 2,
            context: context.encode(),
            outcomes: vec![ApplyOutcome::Stored],
        }
    }

    #[test]
    fn entry_from_an_earlier_run_does_not_answer_a_new_request() {
        let mut worker = idle_worker();
        worker.incarnation = 2;
        let context = worker.next_context();
        let (tx, mut rx) = oneshot::channel();
        worker.pending_proposals.insert(context, tx);

        // Same node and request id, written before a restart.
        let stale = RequestContext {
            incarnation: 1,
            ..context
        };
        worker.notify_proposer(applied(stale));
        assert!(rx.try_recv().is_err());
        assert_eq!(worker.pending_proposals.len(), 1);

        worker.notify_proposer(applied(context));
        assert_eq!(rx.try_recv().expect("answered"), Ok(vec![ApplyOutcome::Stored]));
        assert!(worker.pending_proposals.is_empty());
    }

    #[test]
    fn each_worker_draws_its_own_incarnation() {
        let incarnations: std::collections::HashSet<u64> =
            (0..8).map(|_| idle_worker().incarnation).collect();
        assert!(incarnations.len() > 1);
    }

    #[test]
    fn frame_round_trips_a_message() {
        let mut msg = Message::default();
        msg.from = 2;
        msg.to = 1;
        msg.term = 5;
        let bytes = msg.encode_to_vec();
        let mut frame = (bytes.len() as u32).to_be_bytes().to_vec();
        frame.extend_from_slice(&bytes);
        let decoded = read_frame(&mut &frame[..]).expect("frame");
        assert_eq!(decoded, msg);
    }

    #[test]
    fn oversized_frame_is_rejected_before_reading_the_body() {
        let frame = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        let err = read_frame(&mut &frame[..]).expect_err("frame too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let frame = u32::MAX.to_be_bytes();
        let err = read_frame(&mut &frame[..]).expect_err("frame too large");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn spawn_rejects_id_missing_from_peers() {
        let config = NodeConfig {
            id: 4,
            listen_addr: "127.0.0.1:0".into(),
            peers: HashMap::from([(1, "127.0.0.1:1".to_string())]),
            data_dir: None,
            snapshot_threshold: 1000,
        };
        let err = spawn_node(config).err().expect("spawn must fail");
        assert!(err.to_string().contains("missing from peers"));
    }

    #[tokio::test]
    async fn single_node_proposes_and_reads() {
        let config = NodeConfig {
            id: 1,
            listen_addr: "127.0.0.1:0".into(),
            peers: HashMap::from([(1, "127.0.0.1:0".to_string())]),
            data_dir: None,
            snapshot_threshold: 1000,
        };
        let handle = spawn_node(config).expect("spawn");
        let mut leader = handle.subscribe_leader();
        handle.campaign().await.expect("campaign");
        tokio::time::timeout(
            Duration::from_secs(5),
            leader.wait_for(|info| info.leader == Some(1)),
        )
        .await
        .expect("leader elected")
        .expect("worker alive");

        let wait = Duration::from_secs(5);
        let outcomes = handle
            .propose(
                &[Command::SetKeyValue {
                    key: "k".into(),
                    value: b"v".to_vec(),
                }],
                wait,
            )
            .await
            .expect("propose");
        assert_eq!(outcomes, vec![ApplyOutcome::Stored]);

        let value = handle
            .read(Query::Get { key: "k".into() }, wait)
            .await
            .expect("read");
        assert_eq!(value, QueryResult::Value(Some(b"v".to_vec())));

        let status = handle.status().await.expect("status");
        assert_eq!(status.role, StateRole::Leader);
        assert!(status.applied_index >= 2);

        handle.shutdown();
    }
}
