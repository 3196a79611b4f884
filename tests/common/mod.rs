#![allow(dead_code)]

use chunkvault::cluster::{ClusterManager, Config};
use chunkvault::storage::ChunkKey;
use chunkvault::{NodeConfig, NodeMode, StorageNode};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::duplex;
use tokio::task::JoinHandle;

pub struct TestNode {
    pub node: StorageNode,
    pub session: JoinHandle<()>,
    _dir: TempDir,
}

impl TestNode {
    pub fn chunk_path(&self, owner: Option<&str>, filename: &str, index: u32) -> PathBuf {
        ChunkKey::new(owner, filename, index)
            .unwrap()
            .path(self.node.store().root())
    }

    /// Drops the node's end of the connection, as if the process died.
    pub async fn kill(self) {
        self.session.abort();
        let _ = self.session.await;
    }
}

pub fn cluster_config(dir: &TempDir, replication_factor: usize) -> Config {
    Config {
        replication_factor,
        snapshot_path: dir.path().join("system_data.json"),
        ..Config::default()
    }
}

pub async fn start_manager(dir: &TempDir, replication_factor: usize) -> ClusterManager {
    ClusterManager::new(cluster_config(dir, replication_factor)).await.unwrap()
}

/// Starts a real storage node on an in-memory connection and registers it.
/// `buffer` is the duplex capacity in bytes in each direction.
pub async fn join_node(manager: &ClusterManager, id: &str, buffer: usize) -> TestNode {
    let dir = TempDir::new().unwrap();
    join_node_at(manager, id, buffer, dir).await
}

pub async fn join_node_at(manager: &ClusterManager, id: &str, buffer: usize, dir: TempDir) -> TestNode {
    let mut config = NodeConfig::new(dir.path(), NodeMode::Listen { port: 0 });
    config.node_id = Some(id.to_string());
    let node = StorageNode::new(config).await.unwrap();

    let (coordinator_side, node_side) = duplex(buffer);
    let serving = node.clone();
    let session = tokio::spawn(async move {
        let _ = serving.session(node_side).await;
    });

    let admitted = manager.admit(coordinator_side, &format!("mem:{}", id)).await.unwrap();
    assert_eq!(admitted.as_str(), id);

    TestNode {
        node,
        session,
        _dir: dir,
    }
}

/// Stores and deletes are fire-and-forget, so disk effects trail the call.
pub async fn eventually(path: &Path, present: bool) -> bool {
    for _ in 0..100 {
        if path.exists() == present {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

pub fn chunk_of(data: &[u8], chunk_size: usize, index: usize) -> bytes::Bytes {
    let start = index * chunk_size;
    let end = (start + chunk_size).min(data.len());
    bytes::Bytes::copy_from_slice(&data[start..end])
}
