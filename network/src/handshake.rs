use tokio::io::{AsyncRead, AsyncWrite, BufReader};

use crate::protocol::{self, Hello, HelloAck};
use crate::{NetworkError, Result};

/// Node side: introduce ourselves and wait for the coordinator's answer.
pub async fn announce<S>(stream: &mut BufReader<S>, hello: &Hello) -> Result<HelloAck>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    protocol::write_frame(stream, hello, None).await?;
    let ack: HelloAck = protocol::read_message(stream).await?;

    if ack.status != "assigned" {
        return Err(NetworkError::Protocol(format!(
            "coordinator refused registration: {}",
            ack.status
        )));
    }
    Ok(ack)
}

/// Coordinator side: the only read the coordinator makes on its own
/// initiative.
pub async fn receive_hello<S>(stream: &mut BufReader<S>) -> Result<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello: Hello = protocol::read_message(stream).await?;
    if hello.node_id.is_empty() || hello.node_id.contains(['\n', '\r']) {
        return Err(NetworkError::Malformed(format!("invalid node id {:?}", hello.node_id)));
    }
    Ok(hello)
}

pub async fn acknowledge<S>(stream: &mut BufReader<S>, node_id: &str, address: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let ack = HelloAck {
        status: "assigned".to_string(),
        node_id: node_id.to_string(),
        address: address.to_string(),
    };
    protocol::write_frame(stream, &ack, None).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let (node_side, coordinator_side) = duplex(1024);

        let coordinator = tokio::spawn(async move {
            let mut stream = BufReader::new(coordinator_side);
            let hello = receive_hello(&mut stream).await.unwrap();
            acknowledge(&mut stream, &hello.node_id, "10.0.0.7:41000").await.unwrap();
            hello
        });

        let mut stream = BufReader::new(node_side);
        let hello = Hello { node_id: "node-a".to_string(), capacity: 1 << 30 };
        let ack = announce(&mut stream, &hello).await.unwrap();

        assert_eq!(ack.node_id, "node-a");
        assert_eq!(ack.address, "10.0.0.7:41000");
        assert_eq!(coordinator.await.unwrap(), hello);
    }
}
