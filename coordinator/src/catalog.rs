//! File metadata: which files exist, their declared shape, and which nodes
//! hold at least one of their chunks.
//!
//! No locking here; callers hold the global state lock.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

use crate::{FileKey, NodeId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Declared by the first writer, not verified.
    pub size: u64,
    pub total_chunks: u32,
    /// File-level replica membership, not a per-chunk map.
    pub locations: BTreeSet<NodeId>,
    pub created_at: DateTime<Utc>,
}

impl FileRecord {
    pub fn new(size: u64, total_chunks: u32) -> Self {
        Self {
            size,
            total_chunks,
            locations: BTreeSet::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct MetadataCatalog {
    files: HashMap<FileKey, FileRecord>,
}

impl MetadataCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the existing record untouched, or creates one. The first
    /// writer's size and chunk count win.
    pub fn get_or_create(&mut self, key: &FileKey, size: u64, total_chunks: u32) -> &mut FileRecord {
        let record = self
            .files
            .entry(key.clone())
            .or_insert_with(|| FileRecord::new(size, total_chunks));

        if record.size != size || record.total_chunks != total_chunks {
            tracing::warn!(
                "{} re-declared as {} bytes / {} chunks; keeping {} bytes / {} chunks",
                key,
                size,
                total_chunks,
                record.size,
                record.total_chunks
            );
        }
        record
    }

    /// Returns false if the node was already listed or the file is unknown.
    pub fn record_replica(&mut self, key: &FileKey, node: &NodeId) -> bool {
        match self.files.get_mut(key) {
            Some(record) => record.locations.insert(node.clone()),
            None => false,
        }
    }

    pub fn remove_replica(&mut self, key: &FileKey, node: &NodeId) -> bool {
        match self.files.get_mut(key) {
            Some(record) => record.locations.remove(node),
            None => false,
        }
    }

    /// Drops `node` from every location set. Returns how many files listed it.
    pub fn purge_node(&mut self, node: &NodeId) -> usize {
        let mut touched = 0;
        for record in self.files.values_mut() {
            if record.locations.remove(node) {
                touched += 1;
            }
        }
        touched
    }

    pub fn delete(&mut self, key: &FileKey) -> Option<BTreeSet<NodeId>> {
        self.files.remove(key).map(|record| record.locations)
    }

    pub fn lookup(&self, key: &FileKey) -> Option<&FileRecord> {
        self.files.get(key)
    }

    pub fn contains(&self, key: &FileKey) -> bool {
        self.files.contains_key(key)
    }

    /// Sorted filenames within one owner scope.
    pub fn files_of(&self, owner: Option<&str>) -> Vec<String> {
        let mut names: Vec<String> = self
            .files
            .keys()
            .filter(|key| key.owner() == owner)
            .map(|key| key.filename.clone())
            .collect();
        names.sort();
        names
    }

    /// Sum of declared sizes within one owner scope.
    pub fn used_by(&self, owner: Option<&str>) -> u64 {
        self.files
            .iter()
            .filter(|(key, _)| key.owner() == owner)
            .map(|(_, record)| record.size)
            .sum()
    }

    pub fn insert(&mut self, key: FileKey, record: FileRecord) {
        self.files.insert(key, record);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FileKey, &FileRecord)> {
        self.files.iter()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
