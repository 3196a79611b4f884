use bytes::Bytes;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{mpsc, oneshot};

use crate::protocol::{self, Command, Reply};
use crate::{Config, NetworkError, Result};

/// Handle to the task that owns one node connection. Dropping the last
/// handle closes it.
#[derive(Clone)]
pub struct NodeLink {
    node_id: String,
    sender: mpsc::Sender<LinkRequest>,
    max_chunk_size: u64,
}

struct LinkRequest {
    command: Command,
    body: Option<Bytes>,
    reply: oneshot::Sender<Result<Option<Bytes>>>,
}

impl std::fmt::Debug for NodeLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeLink")
            .field("node_id", &self.node_id)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl NodeLink {
    pub fn spawn<S>(node_id: impl Into<String>, stream: BufReader<S>, config: &Config) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let node_id = node_id.into();
        let (sender, receiver) = mpsc::channel(config.queue_depth.max(1));
        let io_timeout = Duration::from_millis(config.io_timeout_ms);

        tokio::spawn(Self::handle_connection(
            node_id.clone(),
            stream,
            receiver,
            io_timeout,
            config.max_chunk_size,
        ));

        tracing::debug!("Link task started for node {}", node_id);

        Self {
            node_id,
            sender,
            max_chunk_size: config.max_chunk_size,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    // No reply: Ok only means the bytes were written.
    pub async fn store(&self, owner: Option<&str>, file: &str, index: u32, data: Bytes) -> Result<()> {
        if data.len() as u64 > self.max_chunk_size {
            return Err(NetworkError::ChunkTooLarge(format!(
                "chunk of {} bytes exceeds the {} byte limit",
                data.len(),
                self.max_chunk_size
            )));
        }
        let command = Command::Store {
            file: file.to_string(),
            owner: owner.map(str::to_string),
            index,
            size: data.len() as u64,
        };
        self.request(command, Some(data)).await.map(|_| ())
    }

    pub async fn retrieve(&self, owner: Option<&str>, file: &str, index: u32) -> Result<Bytes> {
        let command = Command::Retrieve {
            file: file.to_string(),
            owner: owner.map(str::to_string),
            index,
        };
        self.request(command, None).await?.ok_or_else(|| {
            NetworkError::Protocol("retrieve finished without a body".to_string())
        })
    }

    pub async fn delete(&self, owner: Option<&str>, file: &str) -> Result<()> {
        let command = Command::Delete {
            file: file.to_string(),
            owner: owner.map(str::to_string),
        };
        self.request(command, None).await.map(|_| ())
    }

    async fn request(&self, command: Command, body: Option<Bytes>) -> Result<Option<Bytes>> {
        let (reply, response) = oneshot::channel();
        let request = LinkRequest { command, body, reply };

        self.sender.send(request).await.map_err(|_| {
            NetworkError::LinkClosed(format!("link to node {} is gone", self.node_id))
        })?;

        response.await.map_err(|_| {
            NetworkError::LinkClosed(format!("link to node {} dropped the request", self.node_id))
        })?
    }

    async fn handle_connection<S>(
        node_id: String,
        mut stream: BufReader<S>,
        mut requests: mpsc::Receiver<LinkRequest>,
        io_timeout: Duration,
        max_chunk_size: u64,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        while let Some(request) = requests.recv().await {
            let op = request.command.name();
            let exchange = Self::exchange(&mut stream, &request.command, request.body.as_deref(), max_chunk_size);

            let result = match tokio::time::timeout(io_timeout, exchange).await {
                Ok(result) => result,
                Err(_) => Err(NetworkError::Timeout(format!(
                    "{} on node {} took longer than {:?}",
                    op, node_id, io_timeout
                ))),
            };

            let lost = matches!(&result, Err(e) if e.is_connection_lost());
            match &result {
                Ok(_) => tracing::trace!("{} on node {} done", op, node_id),
                Err(e) if lost => tracing::warn!("{} on node {} lost the connection: {}", op, node_id, e),
                Err(e) => tracing::debug!("{} on node {} failed: {}", op, node_id, e),
            }

            // The caller may have given up; the exchange still had to finish
            // so the stream stays aligned.
            let _ = request.reply.send(result);

            if lost {
                break;
            }
        }

        tracing::info!("Link to node {} closed", node_id);
    }

    async fn exchange<S>(
        stream: &mut BufReader<S>,
        command: &Command,
        body: Option<&[u8]>,
        max_chunk_size: u64,
    ) -> Result<Option<Bytes>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        protocol::write_frame(stream, command, body).await?;

        if !command.expects_reply() {
            return Ok(None);
        }

        let reply: Reply = protocol::read_message(stream).await.map_err(|e| match e {
            // Without a readable header we cannot tell where the body ends.
            NetworkError::Malformed(msg) => NetworkError::Protocol(format!("unreadable reply: {}", msg)),
            other => other,
        })?;

        match reply {
            Reply::Ok { size } if size > max_chunk_size => Err(NetworkError::Protocol(format!(
                "reply declares {} bytes, limit is {}",
                size, max_chunk_size
            ))),
            Reply::Ok { size } => Ok(Some(protocol::read_body(stream, size).await?)),
            Reply::Error { message } => Err(NetworkError::Remote(message)),
        }
    }
}
