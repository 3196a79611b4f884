//! Durable projection of coordinator metadata.
//!
//! Written to `<path>.tmp`, synced, then renamed over `<path>`, so a reader
//! never observes a partially written snapshot. Live connections are never
//! persisted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::catalog::FileRecord;
use crate::registry::KnownNode;
use crate::{ClusterError, ClusterState, FileKey, NodeId, Result};

pub const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterSnapshot {
    pub version: u32,
    pub files: Vec<SnapshotFile>,
    pub nodes: Vec<KnownNode>,
    pub quota: u64,
    #[serde(default)]
    pub owner_quotas: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub filename: String,
    pub size: u64,
    pub total_chunks: u32,
    pub locations: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl ClusterSnapshot {
    pub fn capture(state: &ClusterState) -> Self {
        let mut files: Vec<SnapshotFile> = state
            .catalog
            .iter()
            .map(|(key, record)| SnapshotFile {
                owner: key.owner.clone(),
                filename: key.filename.clone(),
                size: record.size,
                total_chunks: record.total_chunks,
                locations: record.locations.iter().cloned().collect(),
                created_at: record.created_at,
            })
            .collect();
        files.sort_by(|a, b| (&a.owner, &a.filename).cmp(&(&b.owner, &b.filename)));

        Self {
            version: SNAPSHOT_VERSION,
            files,
            nodes: state.registry.known_nodes(),
            quota: state.quota,
            owner_quotas: state.owner_quotas.clone(),
        }
    }

    /// Rebuilds catalog, known nodes and quotas. No node is online afterwards.
    pub fn restore(self, default_quota: u64) -> Result<ClusterState> {
        let mut state = ClusterState::new(default_quota);

        for file in self.files {
            let key = FileKey::new(file.owner.as_deref(), &file.filename)
                .map_err(|e| ClusterError::Snapshot(format!("bad file entry: {}", e)))?;
            let record = FileRecord {
                size: file.size,
                total_chunks: file.total_chunks,
                locations: file.locations.into_iter().collect(),
                created_at: file.created_at,
            };
            state.catalog.insert(key, record);
        }

        state.registry.restore_known(self.nodes);
        state.quota = self.quota;
        state.owner_quotas = self.owner_quotas;
        Ok(state)
    }
}

pub struct Snapshotter {
    path: PathBuf,
}

impl Snapshotter {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Callers serialize concurrent writes.
    pub async fn write(&self, snapshot: &ClusterSnapshot) -> Result<()> {
        let data = serde_json::to_vec_pretty(snapshot)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let tmp_path = self.tmp_path();
        let mut file = fs::File::create(&tmp_path).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp_path, &self.path).await?;

        tracing::debug!(
            "Snapshot written to {:?} ({} files, {} nodes)",
            self.path,
            snapshot.files.len(),
            snapshot.nodes.len()
        );
        Ok(())
    }

    /// `Ok(None)` when no snapshot has been written yet.
    pub async fn load(&self) -> Result<Option<ClusterSnapshot>> {
        let data = match fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ClusterError::Io(e)),
        };

        let snapshot: ClusterSnapshot = serde_json::from_slice(&data).map_err(|e| {
            ClusterError::Snapshot(format!("{:?} is not a valid snapshot: {}", self.path, e))
        })?;

        if snapshot.version > SNAPSHOT_VERSION {
            return Err(ClusterError::Snapshot(format!(
                "{:?} has version {}, newest supported is {}",
                self.path, snapshot.version, SNAPSHOT_VERSION
            )));
        }

        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn populated_state() -> ClusterState {
        let mut state = ClusterState::new(1000);
        let nodes: Vec<KnownNode> = (0..3)
            .map(|i| KnownNode {
                id: NodeId::new(format!("node-{}", i)),
                address: format!("10.0.0.{}:6000", i),
                capacity: 1 << 20,
                last_registered: Utc::now(),
            })
            .collect();
        state.registry.restore_known(nodes);

        for (owner, name, size) in [(None, "report.pdf", 300), (Some("alice"), "a.bin", 10), (Some("bob"), "a.bin", 20)] {
            let key = FileKey::new(owner, name).unwrap();
            state.catalog.get_or_create(&key, size, 3);
            state.catalog.record_replica(&key, &NodeId::new("node-0"));
            state.catalog.record_replica(&key, &NodeId::new("node-2"));
        }
        state.add_quota(Some("alice"), 500);
        state.add_quota(None, 7);
        state
    }

    #[tokio::test]
    async fn test_snapshot_roundtrip_is_structurally_equal() {
        let dir = TempDir::new().unwrap();
        let snapshotter = Snapshotter::new(dir.path().join("system_data.json"));
        let state = populated_state();

        snapshotter.write(&ClusterSnapshot::capture(&state)).await.unwrap();
        let restored = snapshotter.load().await.unwrap().unwrap().restore(1000).unwrap();

        assert_eq!(restored.catalog, state.catalog);
        assert_eq!(restored.registry.known_nodes(), state.registry.known_nodes());
        assert_eq!(restored.quota, 1007);
        assert_eq!(restored.quota_for(Some("alice")), 1500);
        assert_eq!(restored.quota_for(Some("bob")), 1000);
        assert!(restored.registry.is_empty());
    }

    #[tokio::test]
    async fn test_write_replaces_atomically_without_leftovers() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("meta").join("system_data.json");
        let snapshotter = Snapshotter::new(&path);

        snapshotter.write(&ClusterSnapshot::capture(&ClusterState::new(1))).await.unwrap();
        snapshotter.write(&ClusterSnapshot::capture(&populated_state())).await.unwrap();

        let loaded = snapshotter.load().await.unwrap().unwrap();
        assert_eq!(loaded.files.len(), 3);
        assert!(!snapshotter.tmp_path().exists());
    }

    #[tokio::test]
    async fn test_missing_snapshot_loads_as_none() {
        let dir = TempDir::new().unwrap();
        let snapshotter = Snapshotter::new(dir.path().join("absent.json"));
        assert!(snapshotter.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_snapshot_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("system_data.json");
        std::fs::write(&path, b"{\"files\": [").unwrap();

        let err = Snapshotter::new(&path).load().await.unwrap_err();
        assert!(matches!(err, ClusterError::Snapshot(_)));
    }
}
