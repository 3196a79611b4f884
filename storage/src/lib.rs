mod engine;
mod chunk;

pub use engine::ChunkStore;
pub use chunk::{ChunkKey, Scope, validate_name, MAX_NAME_LEN};

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Chunk not found: {0}")]
    ChunkNotFound(String),

    #[error("Invalid chunk key: {0}")]
    InvalidKey(String),
}
