use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    pub host: IpAddr,
    pub api_port: u16,
    /// Port storage nodes dial to register.
    pub node_port: u16,
    pub replication_factor: usize,
    pub snapshot_path: PathBuf,
    pub default_quota: u64,
    pub quota_increment: u64,
    pub enforce_quota: bool,
    pub io_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub max_upload_bytes: u64,
    pub max_chunk_size: u64,
}

impl CoordinatorConfig {
    pub fn new(host: IpAddr) -> Self {
        Self {
            host,
            api_port: 5000,
            node_port: 6000,
            replication_factor: 2,
            snapshot_path: PathBuf::from("system_data.json"),
            default_quota: 5 * GIB,
            quota_increment: 5 * GIB,
            enforce_quota: false,
            io_timeout_ms: 30_000,
            handshake_timeout_ms: 10_000,
            max_upload_bytes: 500 * MIB,
            max_chunk_size: 500 * MIB,
        }
    }

    pub fn api_address(&self) -> String {
        format!("{}:{}", self.host, self.api_port)
    }

    pub fn node_address(&self) -> String {
        format!("{}:{}", self.host, self.node_port)
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new(IpAddr::from([0, 0, 0, 0]))
    }
}

impl From<CoordinatorConfig> for network::Config {
    fn from(config: CoordinatorConfig) -> Self {
        network::Config {
            io_timeout_ms: config.io_timeout_ms,
            max_chunk_size: config.max_chunk_size,
            ..network::Config::default()
        }
    }
}

impl From<CoordinatorConfig> for coordinator::Config {
    fn from(config: CoordinatorConfig) -> Self {
        coordinator::Config {
            replication_factor: config.replication_factor,
            snapshot_path: config.snapshot_path.clone(),
            default_quota: config.default_quota,
            quota_increment: config.quota_increment,
            enforce_quota: config.enforce_quota,
            handshake_timeout_ms: config.handshake_timeout_ms,
            link: config.into(),
        }
    }
}

impl From<CoordinatorConfig> for api::Config {
    fn from(config: CoordinatorConfig) -> Self {
        api::Config {
            host: config.host,
            port: config.api_port,
            max_upload_bytes: usize::try_from(config.max_upload_bytes).unwrap_or(usize::MAX),
        }
    }
}

/// How a storage node reaches the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeMode {
    /// Dial the coordinator's node port, reconnecting when the session ends.
    Dial { coordinator: String },
    /// Wait for the coordinator to dial in (after a `/register_node` call).
    Listen { port: u16 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Generated and kept under `storage_path` when not given.
    pub node_id: Option<String>,
    pub storage_path: PathBuf,
    /// Advertised in the handshake.
    pub capacity: u64,
    pub host: IpAddr,
    pub mode: NodeMode,
    /// Store bodies above this are drained and dropped.
    pub max_chunk_size: u64,
    pub handshake_timeout_ms: u64,
    pub reconnect_delay_ms: u64,
}

impl NodeConfig {
    pub fn new(storage_path: impl Into<PathBuf>, mode: NodeMode) -> Self {
        Self {
            node_id: None,
            storage_path: storage_path.into(),
            capacity: 100 * GIB,
            host: IpAddr::from([0, 0, 0, 0]),
            mode,
            max_chunk_size: 500 * MIB,
            handshake_timeout_ms: 10_000,
            reconnect_delay_ms: 2_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_defaults_flow_into_crate_configs() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.api_address(), "0.0.0.0:5000");
        assert_eq!(config.node_address(), "0.0.0.0:6000");

        let cluster: coordinator::Config = config.clone().into();
        assert_eq!(cluster.replication_factor, 2);
        assert_eq!(cluster.link.io_timeout_ms, 30_000);
        assert_eq!(cluster.link.max_chunk_size, 500 * MIB);
        assert!(!cluster.enforce_quota);

        let http: api::Config = config.into();
        assert_eq!(http.port, 5000);
        assert_eq!(http.max_upload_bytes as u64, 500 * MIB);
    }
}
