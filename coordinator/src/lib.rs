mod catalog;
mod registry;
mod manager;
mod messages;
mod snapshot;

pub use catalog::{FileRecord, MetadataCatalog};
pub use registry::{KnownNode, NodeRecord, NodeRegistry};
pub use manager::ClusterManager;
pub use messages::{ErrorKind, FileInfo, StatusReport, UploadReceipt};
pub use snapshot::{ClusterSnapshot, SnapshotFile, Snapshotter, SNAPSHOT_VERSION};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use storage::MAX_NAME_LEN;

/// Opaque node identity chosen by the node itself.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Catalog key: one file within an optional owner scope.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileKey {
    pub owner: Option<String>,
    pub filename: String,
}

impl FileKey {
    pub fn new(owner: Option<&str>, filename: &str) -> Result<Self> {
        validate_name("filename", filename)?;
        if let Some(owner) = owner {
            validate_name("owner", owner)?;
        }
        Ok(Self {
            owner: owner.map(str::to_string),
            filename: filename.to_string(),
        })
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }
}

impl fmt::Display for FileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            Some(owner) => write!(f, "{}/{}", owner, self.filename),
            None => f.write_str(&self.filename),
        }
    }
}

fn validate_name(what: &str, name: &str) -> Result<()> {
    let bad_char = name.chars().any(|c| matches!(c, '/' | '\\' | '\0' | '\n' | '\r'));
    if name.is_empty() || name.len() > MAX_NAME_LEN || name == "." || name == ".." || bad_char {
        return Err(ClusterError::InvalidRequest(format!("invalid {} {:?}", what, name)));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target number of nodes each chunk is pushed to.
    pub replication_factor: usize,
    pub snapshot_path: PathBuf,
    pub default_quota: u64,
    pub quota_increment: u64,
    /// Reject new files that would exceed the owner's quota.
    pub enforce_quota: bool,
    pub handshake_timeout_ms: u64,
    pub link: network::Config,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            replication_factor: 2,
            snapshot_path: PathBuf::from("system_data.json"),
            default_quota: 5 * 1024 * 1024 * 1024,
            quota_increment: 5 * 1024 * 1024 * 1024,
            enforce_quota: false,
            handshake_timeout_ms: 10_000,
            link: network::Config::default(),
        }
    }
}

/// Everything guarded by the global state lock.
#[derive(Debug)]
pub struct ClusterState {
    pub catalog: MetadataCatalog,
    pub registry: NodeRegistry,
    /// Quota of the shared (ownerless) scope.
    pub quota: u64,
    pub owner_quotas: BTreeMap<String, u64>,
    default_quota: u64,
}

impl ClusterState {
    pub fn new(default_quota: u64) -> Self {
        Self {
            catalog: MetadataCatalog::new(),
            registry: NodeRegistry::new(),
            quota: default_quota,
            owner_quotas: BTreeMap::new(),
            default_quota,
        }
    }

    pub fn quota_for(&self, owner: Option<&str>) -> u64 {
        match owner {
            None => self.quota,
            Some(owner) => self.owner_quotas.get(owner).copied().unwrap_or(self.default_quota),
        }
    }

    pub fn add_quota(&mut self, owner: Option<&str>, bytes: u64) -> u64 {
        let default_quota = self.default_quota;
        let quota = match owner {
            None => &mut self.quota,
            Some(owner) => self
                .owner_quotas
                .entry(owner.to_string())
                .or_insert(default_quota),
        };
        *quota = quota.saturating_add(bytes);
        *quota
    }

    /// Removes a node and purges it from every file's locations, but only
    /// while `session` is still the node's current registration.
    pub fn evict(&mut self, id: &NodeId, session: Uuid) -> bool {
        match self.registry.get(id) {
            Some(record) if record.session == session => {}
            _ => return false,
        }
        self.registry.evict(id);
        let touched = self.catalog.purge_node(id);
        tracing::warn!(
            "Evicted node {} (session {}); dropped from {} file location set(s)",
            id,
            session,
            touched
        );
        true
    }
}

pub type Result<T> = std::result::Result<T, ClusterError>;

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("Node connection lost: {0}")]
    NodeConnectionLost(String),

    #[error("Quota exceeded: {used} + {requested} > {quota} bytes")]
    QuotaExceeded { used: u64, requested: u64, quota: u64 },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ClusterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClusterError::NotFound(_) => ErrorKind::NotFound,
            ClusterError::Unavailable(_) | ClusterError::NodeConnectionLost(_) => ErrorKind::Unavailable,
            ClusterError::QuotaExceeded { .. } => ErrorKind::QuotaExceeded,
            ClusterError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            ClusterError::Network(e) if e.is_connection_lost() => ErrorKind::Unavailable,
            ClusterError::Snapshot(_)
            | ClusterError::Network(_)
            | ClusterError::Io(_)
            | ClusterError::Serialization(_) => ErrorKind::Internal,
        }
    }
}
