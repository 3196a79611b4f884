use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};

use crate::NodeId;

/// Failure class reported across the core boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Unavailable,
    QuotaExceeded,
    InvalidRequest,
    Internal,
}

/// Outcome of one chunk upload. Fewer written than requested replicas is
/// degraded replication, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReceipt {
    pub replicas_requested: usize,
    pub replicas_written: usize,
    pub nodes: Vec<NodeId>,
}

impl UploadReceipt {
    pub fn is_degraded(&self) -> bool {
        self.replicas_written < self.replicas_requested
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub used: u64,
    pub quota: u64,
    pub nodes_online: usize,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub filename: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub size: u64,
    pub total_chunks: u32,
    pub locations: Vec<NodeId>,
    pub created_at: DateTime<Utc>,
}
