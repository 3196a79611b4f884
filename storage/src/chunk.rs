use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::{Result, StorageError};

/// Longest accepted file or owner name. `<name>.part<u32::MAX>` must still
/// fit in a 255-byte directory entry.
pub const MAX_NAME_LEN: usize = 255 - ".part4294967295".len();

/// Directory a chunk lives in: the shared scope or one owner's scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Shared,
    Owner(String),
}

impl Scope {
    pub fn from_owner(owner: Option<&str>) -> Result<Self> {
        match owner {
            None => Ok(Scope::Shared),
            Some(owner) => {
                validate_name(owner)?;
                Ok(Scope::Owner(owner.to_string()))
            }
        }
    }

    pub fn dir(&self, root: &Path) -> PathBuf {
        match self {
            Scope::Shared => root.join("shared"),
            Scope::Owner(owner) => root.join("users").join(owner),
        }
    }
}

/// Identity of one stored chunk: `(scope, filename, index)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkKey {
    pub scope: Scope,
    pub filename: String,
    pub index: u32,
}

impl ChunkKey {
    pub fn new(owner: Option<&str>, filename: &str, index: u32) -> Result<Self> {
        validate_name(filename)?;
        Ok(Self {
            scope: Scope::from_owner(owner)?,
            filename: filename.to_string(),
            index,
        })
    }

    pub fn file_name(&self) -> String {
        format!("{}.part{}", self.filename, self.index)
    }

    pub fn path(&self, root: &Path) -> PathBuf {
        self.scope.dir(root).join(self.file_name())
    }
}

impl fmt::Display for ChunkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope {
            Scope::Shared => write!(f, "{}#{}", self.filename, self.index),
            Scope::Owner(owner) => write!(f, "{}/{}#{}", owner, self.filename, self.index),
        }
    }
}

/// Rejects names that could escape the chunk directory or break the
/// line-delimited wire format.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(StorageError::InvalidKey(format!(
            "name length must be 1..={} bytes",
            MAX_NAME_LEN
        )));
    }
    if name == "." || name == ".." {
        return Err(StorageError::InvalidKey(format!("reserved name {:?}", name)));
    }
    if name.chars().any(|c| matches!(c, '/' | '\\' | '\0' | '\n' | '\r')) {
        return Err(StorageError::InvalidKey(format!(
            "name {:?} contains a forbidden character",
            name
        )));
    }
    Ok(())
}

/// Parses `<filename>.part<digits>` and returns the index when the stem
/// matches `filename` exactly.
pub(crate) fn chunk_index_of(entry_name: &str, filename: &str) -> Option<u32> {
    let rest = entry_name.strip_prefix(filename)?.strip_prefix(".part")?;
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok()
}
