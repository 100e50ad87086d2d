//! Test harness for managing a cluster of real Raft nodes with TCP networking.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Result};
use replicated_queue::runtime::{spawn_node, NodeConfig, NodeHandle};

pub const WAIT: Duration = Duration::from_secs(5);

pub struct TestCluster {
    pub handles: Vec<NodeHandle>,
}

impl TestCluster {
    /// Spawns N in-memory nodes on localhost with sequential ports starting from base_port.
    pub fn spawn(n: usize, base_port: u16) -> Result<Self> {
        Self::spawn_in(n, base_port, None, 1000)
    }

    /// Spawns N nodes; with `data_root`, node `i` persists under `data_root/node-i`.
    pub fn spawn_in(
        n: usize,
        base_port: u16,
        data_root: Option<&Path>,
        snapshot_threshold: u64,
    ) -> Result<Self> {
        let peers: HashMap<u64, String> = (0..n)
            .map(|i| ((i + 1) as u64, format!("127.0.0.1:{}", base_port + i as u16)))
            .collect();

        let mut handles = Vec::new();
        for i in 0..n {
            let id = (i + 1) as u64;
            handles.push(spawn_node(NodeConfig {
                id,
                listen_addr: peers[&id].clone(),
                peers: peers.clone(),
                data_dir: data_root.map(|root| root.join(format!("node-{id}"))),
                snapshot_threshold,
            })?);
        }
        Ok(Self { handles })
    }

    /// Gets a reference to a node handle by 1-indexed ID.
    pub fn node(&self, id: u64) -> &NodeHandle {
        &self.handles[id as usize - 1]
    }

    /// Waits until every node agrees on the same leader and returns its id.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<u64> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let leaders: Vec<Option<u64>> =
                self.handles.iter().map(|h| h.leader().leader).collect();
            if let Some(Some(leader)) = leaders.first() {
                if leaders.iter().all(|l| *l == Some(*leader)) {
                    let status = self.node(*leader).status().await?;
                    if status.role == raft::StateRole::Leader {
                        return Ok(*leader);
                    }
                }
            }
            if tokio::time::Instant::now() > deadline {
                bail!("timeout waiting for leader consensus, saw {leaders:?}");
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Campaigns `id` until every node follows it.
    pub async fn elect(&self, id: u64) -> Result<()> {
        for _ in 0..5 {
            self.node(id).campaign().await?;
            if let Ok(leader) = self.wait_for_leader(Duration::from_secs(3)).await {
                if leader == id {
                    return Ok(());
                }
            }
        }
        bail!("node {id} never became leader")
    }

    pub fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown();
        }
    }
}

/// Waits until the worker behind `handle` has stopped.
pub async fn wait_stopped(handle: &NodeHandle) -> Result<()> {
    let deadline = tokio::time::Instant::now() + WAIT;
    while handle.status().await.is_ok() {
        if tokio::time::Instant::now() > deadline {
            bail!("node {} did not stop", handle.id());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
