//! Node Link Protocol: the line-delimited header plus raw body framing the
//! coordinator and storage nodes speak, the registration handshake, and the
//! per-node link task that serializes exchanges on one connection.

pub mod protocol;
mod handshake;
mod communication;

pub use communication::NodeLink;
pub use handshake::{announce, acknowledge, receive_hello};
pub use protocol::{Command, Reply, Hello, HelloAck};

use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, NetworkError>;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Framing is lost; the connection cannot be reused.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A header that could not be parsed. The frame is skipped.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// The peer answered with an error status.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Rejected before touching the connection.
    #[error("Chunk too large: {0}")]
    ChunkTooLarge(String),

    #[error("Link closed: {0}")]
    LinkClosed(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl NetworkError {
    /// True when the connection that produced this error must be dropped
    /// and its node evicted.
    pub fn is_connection_lost(&self) -> bool {
        match self {
            NetworkError::Io(_)
            | NetworkError::ConnectionClosed
            | NetworkError::Timeout(_)
            | NetworkError::Protocol(_)
            | NetworkError::LinkClosed(_) => true,
            NetworkError::Malformed(_)
            | NetworkError::Remote(_)
            | NetworkError::ChunkTooLarge(_)
            | NetworkError::Serialization(_) => false,
        }
    }

    pub(crate) fn from_read(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            NetworkError::ConnectionClosed
        } else {
            NetworkError::Io(err)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Upper bound on one request/response exchange with a node.
    pub io_timeout_ms: u64,
    /// Requests that may wait for a node's link before senders back off.
    pub queue_depth: usize,
    /// Largest chunk body accepted from the wire.
    pub max_chunk_size: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            io_timeout_ms: 30_000,
            queue_depth: 64,
            max_chunk_size: 512 * 1024 * 1024,
        }
    }
}
