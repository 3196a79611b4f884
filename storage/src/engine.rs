use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use bytes::Bytes;
use uuid::Uuid;

use crate::{Result, StorageError};
use crate::chunk::{chunk_index_of, ChunkKey, Scope};

pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join("shared")).await?;
        fs::create_dir_all(root.join("users")).await?;

        tracing::info!("Chunk store opened at {:?}", root);

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn put(&self, key: &ChunkKey, data: &[u8]) -> Result<()> {
        let dir = key.scope.dir(&self.root);
        fs::create_dir_all(&dir).await?;

        let final_path = dir.join(key.file_name());
        let tmp_path = dir.join(format!(".tmp-{}", Uuid::new_v4()));

        let mut file = fs::File::create(&tmp_path).await?;
        if let Err(e) = write_all_synced(&mut file, data).await {
            drop(file);
            let _ = fs::remove_file(&tmp_path).await;
            return Err(e);
        }
        drop(file);
        fs::rename(&tmp_path, &final_path).await?;

        tracing::debug!("Stored chunk {} ({} bytes)", key, data.len());
        Ok(())
    }

    pub async fn get(&self, key: &ChunkKey) -> Result<Bytes> {
        match fs::read(key.path(&self.root)).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::ChunkNotFound(key.to_string()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    pub async fn contains(&self, key: &ChunkKey) -> bool {
        fs::metadata(key.path(&self.root)).await.is_ok()
    }

    pub async fn delete_file(&self, scope: &Scope, filename: &str) -> Result<usize> {
        crate::chunk::validate_name(filename)?;

        let dir = scope.dir(&self.root);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if chunk_index_of(name, filename).is_none() {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => removed += 1,
                // Lost a race with another delete.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::Io(e)),
            }
        }

        tracing::info!("Deleted {} chunk(s) of {:?}", removed, filename);
        Ok(removed)
    }

    // Only the scope directories count, not the node id file.
    pub async fn usage(&self) -> Result<u64> {
        let mut total = 0u64;
        let mut pending = vec![self.root.join("shared"), self.root.join("users")];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::Io(e)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if let Ok(metadata) = entry.metadata().await {
                    total += metadata.len();
                }
            }
        }

        Ok(total)
    }
}

async fn write_all_synced(file: &mut fs::File, data: &[u8]) -> Result<()> {
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_all().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, ChunkStore) {
        let dir = TempDir::new().unwrap();
        let store = ChunkStore::new(dir.path()).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_get_returns_exact_bytes() {
        let (_dir, store) = open_store().await;
        let key = ChunkKey::new(None, "report.pdf", 0).unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();

        store.put(&key, &data).await.unwrap();

        assert_eq!(store.get(&key).await.unwrap().as_ref(), data.as_slice());
        assert!(store.contains(&key).await);
    }

    #[tokio::test]
    async fn test_put_overwrites_existing_chunk() {
        let (_dir, store) = open_store().await;
        let key = ChunkKey::new(None, "a.bin", 1).unwrap();

        store.put(&key, b"first version").await.unwrap();
        store.put(&key, b"second").await.unwrap();

        assert_eq!(store.get(&key).await.unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn test_put_accepts_longest_name() {
        let (_dir, store) = open_store().await;
        let key = ChunkKey::new(Some("alice"), &"a".repeat(crate::MAX_NAME_LEN), u32::MAX).unwrap();

        store.put(&key, b"abc").await.unwrap();

        assert_eq!(store.get(&key).await.unwrap().as_ref(), b"abc");
        assert_eq!(store.delete_file(&key.scope, &key.filename).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_chunk_is_not_found() {
        let (_dir, store) = open_store().await;
        let key = ChunkKey::new(None, "ghost", 4).unwrap();

        assert!(matches!(store.get(&key).await, Err(StorageError::ChunkNotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_file_removes_all_indices_only() {
        let (_dir, store) = open_store().await;
        for index in 0..3 {
            let key = ChunkKey::new(None, "a.txt", index).unwrap();
            store.put(&key, b"x").await.unwrap();
        }
        let neighbour = ChunkKey::new(None, "a.txt2", 0).unwrap();
        store.put(&neighbour, b"keep").await.unwrap();

        let removed = store.delete_file(&Scope::Shared, "a.txt").await.unwrap();

        assert_eq!(removed, 3);
        assert!(!store.contains(&ChunkKey::new(None, "a.txt", 0).unwrap()).await);
        assert_eq!(store.get(&neighbour).await.unwrap().as_ref(), b"keep");

        // Nothing left to delete is still a success.
        assert_eq!(store.delete_file(&Scope::Shared, "a.txt").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_owner_scopes_are_isolated() {
        let (_dir, store) = open_store().await;
        let alice = ChunkKey::new(Some("alice"), "notes", 0).unwrap();
        let bob = ChunkKey::new(Some("bob"), "notes", 0).unwrap();

        store.put(&alice, b"alice data").await.unwrap();
        store.put(&bob, b"bob data").await.unwrap();
        store
            .delete_file(&Scope::Owner("alice".to_string()), "notes")
            .await
            .unwrap();

        assert!(!store.contains(&alice).await);
        assert_eq!(store.get(&bob).await.unwrap().as_ref(), b"bob data");
    }

    #[tokio::test]
    async fn test_usage_counts_stored_bytes() {
        let (_dir, store) = open_store().await;
        store.put(&ChunkKey::new(None, "a", 0).unwrap(), &[0u8; 100]).await.unwrap();
        store.put(&ChunkKey::new(Some("u"), "b", 0).unwrap(), &[0u8; 50]).await.unwrap();

        assert_eq!(store.usage().await.unwrap(), 150);
    }
}
