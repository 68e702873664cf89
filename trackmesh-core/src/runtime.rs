//! Node lifecycle: bind, serve, gossip, shut down
//!
//! The protocol server and the gossip loop run as two supervised tasks that
//! share one cancellation token. Ctrl+C cancels both, waits for them, then
//! writes the node's state to disk.

use std::future::Future;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{Config, ConfigError};
use crate::node::{Node, NodeError};

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Node error: {0}")]
    Node(#[from] NodeError),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("Task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Run a node with the given configuration until Ctrl+C
pub async fn run_node(config: Config) -> Result<(), RuntimeError> {
    run_until(config, async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
        }
        info!("Received Ctrl+C, shutting down...");
    })
    .await
}

/// Run a node until `shutdown` completes
pub async fn run_until(
    config: Config,
    shutdown: impl Future<Output = ()>,
) -> Result<(), RuntimeError> {
    let bind_addr = config.bind_addr();
    let listener = TcpListener::bind(&bind_addr)
        .await
        .map_err(|source| RuntimeError::Bind {
            addr: bind_addr.clone(),
            source,
        })?;
    let port = listener.local_addr().map_err(NodeError::from)?.port();

    let node = Node::open(config.node_config(port)?).await?;
    info!(node_id = %node.node_id(), addr = %node.local_addr(), "Node started");

    let cancel = CancellationToken::new();

    let server = {
        let node = node.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { node.serve(listener, cancel).await })
    };
    let gossip = {
        let node = node.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { node.run_gossip(cancel).await })
    };

    shutdown.await;
    cancel.cancel();

    let served = server.await?;
    gossip.await?;

    node.persist().await?;
    info!("Node stopped");
    served.map_err(RuntimeError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_until_shutdown_persists_state() {
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        };

        run_until(config, tokio::time::sleep(Duration::from_millis(200)))
            .await
            .unwrap();

        assert!(dir.path().join(crate::node::CATALOG_FILE).exists());
        assert!(dir.path().join(crate::node::PEERS_FILE).exists());
    }

    #[tokio::test]
    async fn test_bind_failure_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dir = TempDir::new().unwrap();
        let config = Config {
            data_dir: dir.path().to_path_buf(),
            host: "127.0.0.1".to_string(),
            port: taken.local_addr().unwrap().port(),
            ..Config::default()
        };

        let result = run_until(config, async {}).await;
        assert!(matches!(result, Err(RuntimeError::Bind { .. })));
    }
}
