//! Node configuration from the command line and environment.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, ensure, Context, Result};
use clap::{Parser, ValueHint};

use crate::runtime::NodeConfig;
use crate::state::RetryPolicy;

/// Command-line arguments for a replicated queue node.
///
/// Every flag can also be set through the matching `RQ_*` environment
/// variable.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Run a raft-replicated queue node")]
pub struct NodeArgs {
    /// Numeric node ID (must match one entry in --peer)
    #[arg(long, env = "RQ_ID")]
    pub id: u64,

    /// Address this node should listen on for Raft messages, e.g. 127.0.0.1:7101
    #[arg(long, env = "RQ_LISTEN", value_hint = ValueHint::Hostname)]
    pub listen: String,

    /// Address for the HTTP command endpoints, e.g. 127.0.0.1:8101
    #[arg(long, env = "RQ_HTTP", value_hint = ValueHint::Hostname)]
    pub http: String,

    /// Comma-separated raft peer map: id=addr,id=addr,... (must include self)
    #[arg(long, env = "RQ_PEER", value_delimiter = ',', value_hint = ValueHint::Other)]
    pub peer: Vec<String>,

    /// Comma-separated HTTP address map used to redirect writes to the leader
    #[arg(long, env = "RQ_HTTP_PEER", value_delimiter = ',', value_hint = ValueHint::Other)]
    pub http_peer: Vec<String>,

    /// Directory for the raft log and snapshots; state is kept in memory when unset
    #[arg(long, env = "RQ_DATA_DIR", value_hint = ValueHint::DirPath)]
    pub data_dir: Option<PathBuf>,

    /// Seconds a popped element may run before it is handed out again
    #[arg(long, env = "RQ_RETRY_TIMEOUT_SECONDS", default_value_t = 30)]
    pub retry_timeout_seconds: i32,

    /// Backoff before each retry, in seconds
    #[arg(
        long,
        env = "RQ_RETRY_DELAYS_SECONDS",
        value_delimiter = ',',
        default_value = "2,6,20"
    )]
    pub retry_delays_seconds: Vec<i32>,

    /// Outcome codes that trigger a retry
    #[arg(
        long,
        env = "RQ_RETRYABLE_STATUS_CODES",
        value_delimiter = ',',
        default_value = "408,429,500,502,503,504"
    )]
    pub retryable_status_codes: Vec<i32>,

    /// How long a request waits for commit or a read barrier
    #[arg(long, env = "RQ_REQUEST_TIMEOUT_MS", default_value_t = 5000)]
    pub request_timeout_ms: u64,

    /// Applied entries between snapshots
    #[arg(long, env = "RQ_SNAPSHOT_THRESHOLD", default_value_t = 1000)]
    pub snapshot_threshold: u64,
}

/// Validated settings, split by consumer.
#[derive(Debug, Clone)]
pub struct Settings {
    pub node: NodeConfig,
    pub http_addr: String,
    pub endpoints: EndpointSettings,
}

/// What the HTTP layer needs to build and route commands.
#[derive(Debug, Clone)]
pub struct EndpointSettings {
    /// Policy stamped on every pushed element.
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    /// HTTP address of each node, for leader redirects.
    pub http_peers: HashMap<u64, String>,
}

impl NodeArgs {
    pub fn into_settings(self) -> Result<Settings> {
        let peers = parse_peers(&self.peer).context("invalid --peer")?;
        ensure!(
            peers.get(&self.id).map(String::as_str) == Some(self.listen.as_str()),
            "self id {} must map to listen addr {} via --peer entries",
            self.id,
            self.listen
        );

        let mut http_peers = if self.http_peer.is_empty() {
            HashMap::new()
        } else {
            parse_peers(&self.http_peer).context("invalid --http-peer")?
        };
        http_peers.entry(self.id).or_insert_with(|| self.http.clone());

        ensure!(
            self.retry_timeout_seconds >= 0,
            "--retry-timeout-seconds must not be negative"
        );
        ensure!(
            self.retry_delays_seconds.iter().all(|delay| *delay >= 0),
            "--retry-delays-seconds must not contain negative delays"
        );
        ensure!(self.snapshot_threshold > 0, "--snapshot-threshold must be positive");

        Ok(Settings {
            node: NodeConfig {
                id: self.id,
                listen_addr: self.listen,
                peers,
                data_dir: self.data_dir,
                snapshot_threshold: self.snapshot_threshold,
            },
            http_addr: self.http,
            endpoints: EndpointSettings {
                retry: RetryPolicy {
                    timeout_seconds: self.retry_timeout_seconds,
                    delays_seconds: self.retry_delays_seconds,
                    retryable_status_codes: self.retryable_status_codes,
                },
                request_timeout: Duration::from_millis(self.request_timeout_ms),
                http_peers,
            },
        })
    }
}

/// Parses `id=addr` entries into a map.
pub fn parse_peers(entries: &[String]) -> Result<HashMap<u64, String>> {
    let mut peers = HashMap::new();
    for entry in entries {
        let Some((id_str, addr)) = entry.split_once('=') else {
            return Err(anyhow!("invalid peer entry '{entry}', expected id=addr"));
        };
        let id: u64 = id_str
            .parse()
            .with_context(|| format!("invalid peer id in '{entry}'"))?;
        peers.insert(id, addr.to_string());
    }
    if peers.is_empty() {
        return Err(anyhow!("at least one peer entry is required (include self)"));
    }
    Ok(peers)
}
