use crate::config::CoordinatorConfig;
use crate::error::{ChunkvaultError, Result};
use coordinator::ClusterManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// The coordinator process: node listener plus HTTP surface over one
/// cluster manager.
pub struct Coordinator {
    config: CoordinatorConfig,
    manager: Arc<ClusterManager>,
    api_server: Arc<api::Server>,
}

impl Coordinator {
    pub async fn new(config: CoordinatorConfig) -> Result<Self> {
        info!(
            "Initializing coordinator (API {}, nodes {})",
            config.api_address(),
            config.node_address()
        );

        let manager = Arc::new(ClusterManager::new(config.clone().into()).await?);
        let api_server = Arc::new(api::Server::new(config.clone().into(), manager.clone()));

        Ok(Self {
            config,
            manager,
            api_server,
        })
    }

    pub fn manager(&self) -> Arc<ClusterManager> {
        self.manager.clone()
    }

    pub async fn start(self) -> Result<()> {
        let node_address = self.config.node_address();
        let listener = TcpListener::bind(&node_address).await.map_err(|e| {
            ChunkvaultError::InvalidConfig(format!("Failed to bind node listener to {}: {}", node_address, e))
        })?;
        info!("Accepting storage nodes on {}", node_address);

        let node_task = {
            let manager = self.manager.clone();
            tokio::spawn(async move { accept_nodes(manager, listener).await })
        };

        let api_task = {
            let api = self.api_server.clone();
            tokio::spawn(async move { api.start().await })
        };

        tokio::select! {
            result = node_task => {
                error!("Node listener stopped: {:?}", result);
                match result {
                    Ok(Err(e)) => Err(e),
                    _ => Err(ChunkvaultError::ServiceStopped("node listener".to_string())),
                }
            }
            result = api_task => {
                error!("API server stopped: {:?}", result);
                match result {
                    Ok(Err(e)) => Err(e.into()),
                    _ => Err(ChunkvaultError::ServiceStopped("API server".to_string())),
                }
            }
        }
    }
}

/// Runs the handshake for every inbound node connection on its own task.
pub async fn accept_nodes(manager: Arc<ClusterManager>, listener: TcpListener) -> Result<()> {
    loop {
        let (stream, peer) = listener.accept().await?;
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Cannot disable Nagle for {}: {}", peer, e);
        }

        let manager = manager.clone();
        tokio::spawn(async move {
            match manager.admit(stream, &peer.to_string()).await {
                Ok(node_id) => info!("Node {} registered from {}", node_id, peer),
                Err(e) => warn!("Rejected node connection from {}: {}", peer, e),
            }
        });
    }
}
