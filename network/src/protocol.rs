//! Frame codec.
//!
//! A frame is one JSON header terminated by `\n`, optionally followed by
//! exactly `size` raw bytes. Headers carry no length prefix, so a reader
//! buffers until the delimiter, then reads the declared body length exactly,
//! however many partial reads that takes.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{NetworkError, Result};

pub const HEADER_DELIMITER: u8 = b'\n';
pub const MAX_HEADER_LEN: usize = 64 * 1024;

/// Coordinator-to-node request header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "lowercase")]
pub enum Command {
    /// Followed by `size` body bytes. No reply.
    Store {
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
        index: u32,
        size: u64,
    },
    /// Answered by a [`Reply`].
    Retrieve {
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
        index: u32,
    },
    /// Removes every chunk of `file`. No reply.
    Delete {
        file: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        owner: Option<String>,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::Store { .. } => "store",
            Command::Retrieve { .. } => "retrieve",
            Command::Delete { .. } => "delete",
        }
    }

    pub fn expects_reply(&self) -> bool {
        matches!(self, Command::Retrieve { .. })
    }
}

/// Node-to-coordinator answer to a retrieve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Reply {
    /// Followed by `size` body bytes.
    Ok { size: u64 },
    Error { message: String },
}

/// First message on every node connection, sent by the node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub node_id: String,
    pub capacity: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelloAck {
    pub status: String,
    pub node_id: String,
    pub address: String,
}

/// Reads one header line without its delimiter.
///
/// Returns `Ok(None)` on a clean end of stream between frames.
pub async fn read_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    let read = (&mut *reader)
        .take(MAX_HEADER_LEN as u64 + 1)
        .read_until(HEADER_DELIMITER, &mut line)
        .await
        .map_err(NetworkError::from_read)?;

    if read == 0 {
        return Ok(None);
    }
    if line.last() != Some(&HEADER_DELIMITER) {
        if line.len() > MAX_HEADER_LEN {
            return Err(NetworkError::Protocol(format!(
                "header exceeds {} bytes without a delimiter",
                MAX_HEADER_LEN
            )));
        }
        return Err(NetworkError::ConnectionClosed);
    }

    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

pub fn decode<T: DeserializeOwned>(line: &[u8]) -> Result<T> {
    serde_json::from_slice(line).map_err(|e| {
        NetworkError::Malformed(format!("{} in {:?}", e, String::from_utf8_lossy(line)))
    })
}

/// Reads one header and decodes it. End of stream is an error here.
pub async fn read_message<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    match read_line(reader).await? {
        Some(line) => decode(&line),
        None => Err(NetworkError::ConnectionClosed),
    }
}

/// Reads exactly `len` body bytes.
pub async fn read_body<R>(reader: &mut R, len: u64) -> Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    let len = usize::try_from(len)
        .map_err(|_| NetworkError::Protocol(format!("body of {} bytes is not addressable", len)))?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(NetworkError::from_read)?;
    Ok(Bytes::from(body))
}

/// Consumes and discards `len` body bytes so the next header lines up.
pub async fn skip_body<R>(reader: &mut R, len: u64) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let skipped = tokio::io::copy(&mut (&mut *reader).take(len), &mut tokio::io::sink()).await?;
    if skipped < len {
        return Err(NetworkError::ConnectionClosed);
    }
    Ok(())
}

/// Writes a header line and an optional body, then flushes.
pub async fn write_frame<W, H>(writer: &mut W, header: &H, body: Option<&[u8]>) -> Result<()>
where
    W: AsyncWrite + Unpin,
    H: Serialize,
{
    let mut frame = serde_json::to_vec(header)?;
    frame.push(HEADER_DELIMITER);
    writer.write_all(&frame).await?;
    if let Some(body) = body {
        writer.write_all(body).await?;
    }
    writer.flush().await?;
    Ok(())
}
