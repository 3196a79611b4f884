pub mod config;
pub mod coordinator;
pub mod node;
pub mod error;

pub use config::{CoordinatorConfig, NodeConfig, NodeMode};
pub use self::coordinator::{accept_nodes, Coordinator};
pub use node::{serve_connection, StorageNode};
pub use error::{ChunkvaultError, Result};

// Re-export key types from workspace crates
pub use storage;
pub use network;
pub use api;
pub use ::coordinator as cluster;
