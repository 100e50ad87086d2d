//! Entry point for a replicated queue node.
//!
//! Starts the Raft worker and serves the HTTP command endpoints.
//!
//! # Example usage
//!
//! Start a 3-node cluster:
//! ```bash
//! # Terminal 1 (node 1)
//! cargo run --bin replicated-queue-node -- \
//!   --id 1 --listen 127.0.0.1:7101 --http 127.0.0.1:8101 \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103 \
//!   --http-peer 1=127.0.0.1:8101,2=127.0.0.1:8102,3=127.0.0.1:8103 \
//!   --data-dir /tmp/rq-1
//!
//! # Terminals 2 and 3: same peer maps, with --id 2/3 and matching addresses
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use replicated_queue::clock::SystemTicks;
use replicated_queue::config::NodeArgs;
use replicated_queue::endpoints;
use replicated_queue::runtime::spawn_node;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = NodeArgs::parse().into_settings()?;
    let node_id = settings.node.id;
    let handle = spawn_node(settings.node)?;

    let app = endpoints::router(handle.clone(), Arc::new(SystemTicks), settings.endpoints);
    let listener = tokio::net::TcpListener::bind(&settings.http_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.http_addr))?;
    info!(node = node_id, addr = %settings.http_addr, "serving http");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("http server failed")?;

    info!(node = node_id, "shutting down");
    handle.shutdown();
    Ok(())
}
