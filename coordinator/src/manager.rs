use bytes::Bytes;
use futures::future::join_all;
use network::{NetworkError, NodeLink};
use rand::seq::SliceRandom;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::messages::{FileInfo, StatusReport, UploadReceipt};
use crate::registry::NodeRecord;
use crate::snapshot::{ClusterSnapshot, Snapshotter};
use crate::{ClusterError, ClusterState, Config, FileKey, NodeId, Result};

// The state lock is never held across node I/O.
pub struct ClusterManager {
    config: Config,
    state: RwLock<ClusterState>,
    snapshotter: Snapshotter,
    snapshot_lock: Mutex<()>,
}

struct Target {
    id: NodeId,
    session: Uuid,
    link: NodeLink,
}

impl From<&NodeRecord> for Target {
    fn from(record: &NodeRecord) -> Self {
        Self {
            id: record.id.clone(),
            session: record.session,
            link: record.link().clone(),
        }
    }
}

impl ClusterManager {
    pub async fn new(config: Config) -> Result<Self> {
        let snapshotter = Snapshotter::new(&config.snapshot_path);

        let state = match snapshotter.load().await? {
            Some(snapshot) => {
                let state = snapshot.restore(config.default_quota)?;
                tracing::info!(
                    "Restored {} file(s) and {} known node(s) from {:?}",
                    state.catalog.len(),
                    state.registry.known_nodes().len(),
                    snapshotter.path()
                );
                state
            }
            None => {
                tracing::info!("No snapshot at {:?}, starting empty", snapshotter.path());
                ClusterState::new(config.default_quota)
            }
        };

        Ok(Self {
            config,
            state: RwLock::new(state),
            snapshotter,
            snapshot_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub async fn admit<S>(&self, stream: S, peer: &str) -> Result<NodeId>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut stream = BufReader::new(stream);
        let handshake_timeout = Duration::from_millis(self.config.handshake_timeout_ms);

        let handshake = async {
            let hello = network::receive_hello(&mut stream).await?;
            network::acknowledge(&mut stream, &hello.node_id, peer).await?;
            Ok::<_, NetworkError>(hello)
        };
        let hello = tokio::time::timeout(handshake_timeout, handshake)
            .await
            .map_err(|_| {
                NetworkError::Timeout(format!("no handshake from {} within {:?}", peer, handshake_timeout))
            })??;

        let id = NodeId::new(hello.node_id);
        let link = NodeLink::spawn(id.as_str(), stream, &self.config.link);
        self.register_node(id.clone(), peer.to_string(), hello.capacity, link).await;

        Ok(id)
    }

    pub async fn register_node(&self, id: NodeId, address: String, capacity: u64, link: NodeLink) -> Uuid {
        let session = {
            let mut state = self.state.write().await;
            state.registry.register(id.clone(), address.clone(), capacity, link).session
        };
        tracing::info!("Node {} connected from {} ({} bytes capacity)", id, address, capacity);

        self.save_logged().await;
        session
    }

    pub async fn evict(&self, id: &NodeId, session: Uuid) -> bool {
        self.state.write().await.evict(id, session)
    }

    pub async fn is_online(&self, id: &NodeId) -> bool {
        self.state.read().await.registry.is_online(id)
    }

    pub async fn online_nodes(&self) -> Vec<NodeId> {
        self.state.read().await.registry.online_ids()
    }

    pub async fn upload(
        &self,
        owner: Option<&str>,
        filename: &str,
        index: u32,
        total_chunks: u32,
        total_size: u64,
        data: Bytes,
    ) -> Result<UploadReceipt> {
        let key = FileKey::new(owner, filename)?;
        if total_chunks == 0 || index >= total_chunks {
            return Err(ClusterError::InvalidRequest(format!(
                "chunk index {} out of range for {} chunk(s)",
                index, total_chunks
            )));
        }
        let replication_factor = self.config.replication_factor.max(1);

        let targets = {
            let state = self.state.read().await;
            if state.registry.is_empty() {
                return Err(ClusterError::Unavailable("no storage nodes online".to_string()));
            }
            if self.config.enforce_quota && !state.catalog.contains(&key) {
                let used = state.catalog.used_by(key.owner());
                let quota = state.quota_for(key.owner());
                if used.saturating_add(total_size) > quota {
                    return Err(ClusterError::QuotaExceeded { used, requested: total_size, quota });
                }
            }
            self.place(&state, &key, replication_factor)
        };

        let pushes = targets.iter().map(|target| {
            let data = data.clone();
            let key = &key;
            async move {
                target
                    .link
                    .store(key.owner(), &key.filename, index, data)
                    .await
            }
        });
        let results = join_all(pushes).await;

        let mut written = Vec::new();
        let mut lost = Vec::new();
        for (target, result) in targets.iter().zip(results) {
            match result {
                Ok(()) => written.push(target),
                Err(e) if e.is_connection_lost() => {
                    tracing::warn!("Node {} died while storing {} chunk {}: {}", target.id, key, index, e);
                    lost.push(target);
                }
                Err(e) => tracing::warn!("Node {} refused {} chunk {}: {}", target.id, key, index, e),
            }
        }

        {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            for target in &lost {
                state.evict(&target.id, target.session);
            }
            if !written.is_empty() {
                state.catalog.get_or_create(&key, total_size, total_chunks);
                for target in &written {
                    state.catalog.record_replica(&key, &target.id);
                    state.registry.record_usage(&target.id, data.len() as u64);
                }
            }
        }

        if written.is_empty() {
            return Err(ClusterError::Unavailable(format!(
                "all {} selected node(s) failed to store {} chunk {}",
                targets.len(),
                key,
                index
            )));
        }

        let receipt = UploadReceipt {
            replicas_requested: replication_factor,
            replicas_written: written.len(),
            nodes: written.iter().map(|target| target.id.clone()).collect(),
        };
        if receipt.is_degraded() {
            tracing::warn!(
                "{} chunk {} written to {} of {} replicas",
                key,
                index,
                receipt.replicas_written,
                receipt.replicas_requested
            );
        }

        let last = index + 1 == total_chunks;
        if index == 0 || last {
            self.save_logged().await;
        }
        if last {
            tracing::info!("Upload complete: {}", key);
        }

        Ok(receipt)
    }

    // The file's online locations first, then random others.
    fn place(&self, state: &ClusterState, key: &FileKey, replication_factor: usize) -> Vec<Target> {
        let mut chosen: Vec<NodeId> = state
            .catalog
            .lookup(key)
            .map(|record| {
                record
                    .locations
                    .iter()
                    .filter(|id| state.registry.is_online(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        chosen.shuffle(&mut rand::thread_rng());
        chosen.truncate(replication_factor);

        let extra = state.registry.select(replication_factor - chosen.len(), &chosen);
        chosen.extend(extra);

        chosen
            .iter()
            .filter_map(|id| state.registry.get(id))
            .map(Target::from)
            .collect()
    }

    pub async fn download(&self, owner: Option<&str>, filename: &str, index: u32) -> Result<Bytes> {
        let key = FileKey::new(owner, filename)?;

        let candidates: Vec<Target> = {
            let state = self.state.read().await;
            let record = state
                .catalog
                .lookup(&key)
                .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
            let mut candidates: Vec<Target> = record
                .locations
                .iter()
                .filter_map(|id| state.registry.get(id))
                .map(Target::from)
                .collect();
            candidates.shuffle(&mut rand::thread_rng());
            candidates
        };

        if candidates.is_empty() {
            return Err(ClusterError::Unavailable(format!("no online replica holds {}", key)));
        }

        for target in &candidates {
            match target.link.retrieve(key.owner(), &key.filename, index).await {
                Ok(data) => {
                    tracing::debug!("Served {} chunk {} from node {}", key, index, target.id);
                    return Ok(data);
                }
                Err(e) if e.is_connection_lost() => {
                    self.evict(&target.id, target.session).await;
                    return Err(ClusterError::NodeConnectionLost(format!(
                        "node {} died while serving {} chunk {}: {}",
                        target.id, key, index, e
                    )));
                }
                Err(e) => {
                    tracing::debug!("Node {} cannot serve {} chunk {}: {}", target.id, key, index, e);
                }
            }
        }

        Err(ClusterError::NotFound(format!("chunk {} of {}", index, key)))
    }

    pub async fn delete(&self, owner: Option<&str>, filename: &str) -> Result<()> {
        let key = FileKey::new(owner, filename)?;

        let targets: Vec<Target> = {
            let state = self.state.read().await;
            let record = state
                .catalog
                .lookup(&key)
                .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;
            record
                .locations
                .iter()
                .filter_map(|id| state.registry.get(id))
                .map(Target::from)
                .collect()
        };

        let deletes = targets
            .iter()
            .map(|target| target.link.delete(key.owner(), &key.filename));
        let results = join_all(deletes).await;

        {
            let mut state = self.state.write().await;
            for (target, result) in targets.iter().zip(results) {
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_connection_lost() => {
                        state.evict(&target.id, target.session);
                    }
                    Err(e) => tracing::debug!("Node {} ignored delete of {}: {}", target.id, key, e),
                }
            }
            state.catalog.delete(&key);
        }

        self.save_logged().await;
        tracing::info!("Deleted {}", key);
        Ok(())
    }

    pub async fn file_info(&self, owner: Option<&str>, filename: &str) -> Result<FileInfo> {
        let key = FileKey::new(owner, filename)?;
        let state = self.state.read().await;
        let record = state
            .catalog
            .lookup(&key)
            .ok_or_else(|| ClusterError::NotFound(key.to_string()))?;

        Ok(FileInfo {
            filename: key.filename.clone(),
            owner: key.owner.clone(),
            size: record.size,
            total_chunks: record.total_chunks,
            locations: record.locations.iter().cloned().collect(),
            created_at: record.created_at,
        })
    }

    pub async fn status(&self, owner: Option<&str>) -> Result<StatusReport> {
        if let Some(owner) = owner {
            // Validates the owner name.
            FileKey::new(Some(owner), "-")?;
        }
        let state = self.state.read().await;
        Ok(StatusReport {
            used: state.catalog.used_by(owner),
            quota: state.quota_for(owner),
            nodes_online: state.registry.len(),
            files: state.catalog.files_of(owner),
        })
    }

    pub async fn add_space(&self, owner: Option<&str>) -> Result<u64> {
        if let Some(owner) = owner {
            FileKey::new(Some(owner), "-")?;
        }
        let quota = self
            .state
            .write()
            .await
            .add_quota(owner, self.config.quota_increment);

        tracing::info!("Quota for {} raised to {} bytes", owner.unwrap_or("shared scope"), quota);
        self.save_logged().await;
        Ok(quota)
    }

    pub async fn save(&self) -> Result<()> {
        // Held across projection and write so snapshots land in order.
        let _serial = self.snapshot_lock.lock().await;
        let snapshot = ClusterSnapshot::capture(&*self.state.read().await);
        self.snapshotter.write(&snapshot).await
    }

    async fn save_logged(&self) {
        if let Err(e) = self.save().await {
            tracing::error!("Snapshot to {:?} failed: {}", self.snapshotter.path(), e);
        }
    }
}
