use crate::config::{NodeConfig, NodeMode};
use crate::error::{ChunkvaultError, Result};
use network::protocol::{self, Command, Reply};
use network::{Hello, NetworkError};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use storage::{ChunkKey, ChunkStore, Scope};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

const NODE_ID_FILE: &str = "node_id";

/// A storage node: a chunk store served over node link sessions.
#[derive(Clone)]
pub struct StorageNode {
    config: NodeConfig,
    node_id: String,
    store: Arc<ChunkStore>,
}

impl StorageNode {
    pub async fn new(config: NodeConfig) -> Result<Self> {
        let store = ChunkStore::new(&config.storage_path).await?;
        let node_id = match &config.node_id {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            Some(_) => return Err(ChunkvaultError::InvalidConfig("node id is empty".to_string())),
            None => load_or_create_node_id(&config.storage_path).await?,
        };

        info!("Initializing storage node {} at {:?}", node_id, config.storage_path);

        Ok(Self {
            config,
            node_id,
            store: Arc::new(store),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub async fn start(self) -> Result<()> {
        match self.config.mode.clone() {
            NodeMode::Dial { coordinator } => self.run_dial(&coordinator).await,
            NodeMode::Listen { port } => {
                let addr = format!("{}:{}", self.config.host, port);
                let listener = TcpListener::bind(&addr).await?;
                info!("Node {} waiting for the coordinator on {}", self.node_id, addr);
                self.run_listen(listener).await
            }
        }
    }

    /// Keeps one session with the coordinator alive, redialing after every
    /// disconnect.
    pub async fn run_dial(&self, coordinator: &str) -> Result<()> {
        let delay = Duration::from_millis(self.config.reconnect_delay_ms);

        loop {
            match TcpStream::connect(coordinator).await {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    match self.session(stream).await {
                        Ok(()) => info!("Coordinator at {} closed the session", coordinator),
                        Err(e) => warn!("Session with coordinator at {} ended: {}", coordinator, e),
                    }
                }
                Err(e) => warn!("Cannot reach coordinator at {}: {}", coordinator, e),
            }

            tokio::time::sleep(delay).await;
        }
    }

    /// Accepts coordinator connections; each one gets its own session.
    pub async fn run_listen(&self, listener: TcpListener) -> Result<()> {
        loop {
            let (stream, peer) = listener.accept().await?;
            info!("Coordinator connected from {}", peer);

            let node = self.clone();
            tokio::spawn(async move {
                match node.session(stream).await {
                    Ok(()) => info!("Coordinator at {} closed the session", peer),
                    Err(e) => warn!("Session with coordinator at {} ended: {}", peer, e),
                }
            });
        }
    }

    /// Introduces the node, then serves commands until the stream ends.
    pub async fn session<S>(&self, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        let hello = Hello {
            node_id: self.node_id.clone(),
            capacity: self.config.capacity,
        };

        let handshake_timeout = Duration::from_millis(self.config.handshake_timeout_ms);
        let ack = tokio::time::timeout(handshake_timeout, network::announce(&mut stream, &hello))
            .await
            .map_err(|_| NetworkError::Timeout(format!("no handshake answer within {:?}", handshake_timeout)))??;
        info!("Registered as {} (coordinator sees {})", ack.node_id, ack.address);

        serve_connection(&mut stream, &self.store, self.config.max_chunk_size).await
    }
}

/// Serves commands from one coordinator connection in arrival order.
///
/// Returns `Ok(())` when the coordinator closes the stream between frames.
/// Malformed headers are skipped; an oversized store body is drained so
/// the next header still lines up.
pub async fn serve_connection<S>(stream: &mut BufReader<S>, store: &ChunkStore, max_chunk_size: u64) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(line) = protocol::read_line(stream).await? {
        let command: Command = match protocol::decode(&line) {
            Ok(command) => command,
            Err(e) => {
                warn!("Skipping malformed header: {}", e);
                continue;
            }
        };

        match command {
            Command::Store { file, owner, index, size } => {
                if size > max_chunk_size {
                    warn!(
                        "Dropping {} chunk {}: {} bytes exceeds the {} byte limit",
                        file, index, size, max_chunk_size
                    );
                    protocol::skip_body(stream, size).await?;
                    continue;
                }

                let data = protocol::read_body(stream, size).await?;
                let stored = match ChunkKey::new(owner.as_deref(), &file, index) {
                    Ok(key) => store.put(&key, &data).await.map(|()| key),
                    Err(e) => Err(e),
                };
                match stored {
                    Ok(key) => debug!("Stored {} ({} bytes)", key, data.len()),
                    Err(e) => error!("Failed to store {} chunk {}: {}", file, index, e),
                }
            }
            Command::Retrieve { file, owner, index } => {
                let found = match ChunkKey::new(owner.as_deref(), &file, index) {
                    Ok(key) => store.get(&key).await,
                    Err(e) => Err(e),
                };
                match found {
                    Ok(data) => {
                        let reply = Reply::Ok { size: data.len() as u64 };
                        protocol::write_frame(stream, &reply, Some(&data)).await?;
                    }
                    Err(e) => {
                        debug!("Cannot serve {} chunk {}: {}", file, index, e);
                        let reply = Reply::Error { message: e.to_string() };
                        protocol::write_frame(stream, &reply, None).await?;
                    }
                }
            }
            Command::Delete { file, owner } => {
                let deleted = match Scope::from_owner(owner.as_deref()) {
                    Ok(scope) => store.delete_file(&scope, &file).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = deleted {
                    warn!("Failed to delete {}: {}", file, e);
                }
            }
        }
    }

    Ok(())
}

async fn load_or_create_node_id(storage_path: &Path) -> Result<String> {
    let path = storage_path.join(NODE_ID_FILE);

    match tokio::fs::read_to_string(&path).await {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => warn!("{:?} is empty, generating a new node id", path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(ChunkvaultError::Io(e)),
    }

    let id = format!("node-{}", uuid::Uuid::new_v4());
    tokio::fs::write(&path, format!("{}\n", id)).await?;
    info!("Generated node id {}", id);
    Ok(id)
}
