//! rvid: RVI peer node daemon.
//!
//! Usage: `rvid [CONFIG]`. Without an argument the config comes from
//! `$RVI_CONFIG`, else `./rvi.config`.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};

use rvi_core::config::NodeConfig;
use rvi_node::Node;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(NodeConfig::file_path);
    let config = NodeConfig::load(&path)
        .with_context(|| format!("failed to load config from {}", path.display()))?;
    tracing::info!(config = %path.display(), "rvid starting");

    let listen = config.node.listen;
    let peers = config.node.peers.clone();
    let node = Node::init(config).await.context("failed to initialize node")?;

    // Built-in liveness service, invokable by any peer granted `rvi.ping`.
    node.register_service("rvi.ping", |_name, params| {
        serde_json::json!({ "pong": params.get("seq").cloned().unwrap_or_default() })
    })
    .await
    .context("failed to register rvi.ping")?;

    if let Some(addr) = listen {
        node.listen(addr)
            .await
            .with_context(|| format!("failed to listen on {addr}"))?;
    }

    for peer in &peers {
        let node = node.clone();
        let peer = peer.clone();
        tokio::spawn(async move { dial_with_retry(node, peer).await });
    }

    tokio::signal::ctrl_c().await.ok();
    tracing::info!("shutdown signal received");
    node.shutdown().await;
    Ok(())
}

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Keep a configured peer connected: dial until it answers, and dial again
/// whenever the connection drops.
async fn dial_with_retry(node: Node, peer: String) {
    let Some((host, port)) = split_host_port(&peer) else {
        tracing::warn!(peer = %peer, "ignoring peer without host:port");
        return;
    };

    let mut backoff = MIN_BACKOFF;
    loop {
        match node.connect(&host, port).await {
            Ok(id) => {
                tracing::info!(peer = %peer, connection = %id, "peer connected");
                backoff = MIN_BACKOFF;
                node.closed(id).await;
                tracing::info!(peer = %peer, connection = %id, "peer connection lost; redialing");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                tracing::warn!(
                    peer = %peer,
                    error = %e,
                    retry_in_secs = backoff.as_secs(),
                    "peer connect failed"
                );
                tokio::time::sleep(backoff).await;
                backoff = next_backoff(backoff);
            }
        }
    }
}

fn next_backoff(current: Duration) -> Duration {
    current.saturating_mul(2).min(MAX_BACKOFF)
}

/// `host:port` or `[v6]:port`.
fn split_host_port(peer: &str) -> Option<(String, u16)> {
    let (host, port) = peer.rsplit_once(':')?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port.parse().ok()?))
}
