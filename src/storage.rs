//! Key-value blob storage used for job records, checkpoints, the file
//! registry, and index artifacts.
//!
//! Keys are `/`-separated relative paths such as `jobs/<id>.json`. The
//! filesystem backend maps them onto a root directory and writes atomically
//! (temp file + rename) so a crash never leaves a half-written record.

use crate::error::StorageError;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;

pub const JOBS_PREFIX: &str = "jobs/";
pub const CHECKPOINTS_PREFIX: &str = "checkpoints/";
pub const FILES_PREFIX: &str = "files/";
pub const INDEXES_PREFIX: &str = "indexes/";

pub fn job_key(job_id: &str) -> String {
    format!("{JOBS_PREFIX}{job_id}.json")
}

pub fn checkpoint_key(job_id: &str) -> String {
    format!("{CHECKPOINTS_PREFIX}{job_id}.json")
}

pub fn file_record_key(file_id: &str) -> String {
    format!("{FILES_PREFIX}{file_id}.json")
}

pub fn index_blob_key(file_id: &str) -> String {
    format!("{INDEXES_PREFIX}{file_id}/index.bin")
}

pub fn index_metadata_key(file_id: &str) -> String {
    format!("{INDEXES_PREFIX}{file_id}/metadata.json")
}

/// Durable blob storage.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError>;

    /// Returns `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Returns whether something was deleted.
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// All keys starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    if key.is_empty() || key.starts_with('/') || key.ends_with('/') {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    let path = Path::new(key);
    if path
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(StorageError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Filesystem-backed blob store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn collect_keys(
        &self,
        dir: &Path,
        prefix: &str,
        keys: &mut Vec<String>,
    ) -> Result<(), StorageError> {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, prefix, keys)?;
                continue;
            }
            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .filter_map(|component| component.as_os_str().to_str())
                .collect::<Vec<_>>()
                .join("/");
            // Skip in-flight temp files from atomic writes.
            if key.ends_with(".tmp") {
                continue;
            }
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&temp_path, &data).await?;
        if let Err(error) = tokio::fs::rename(&temp_path, &path).await {
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(error.into());
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(error) => Err(error.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let store = self.clone();
        let prefix = prefix.to_string();
        let mut keys = tokio::task::spawn_blocking(move || {
            let mut keys = Vec::new();
            store.collect_keys(&store.root, &prefix, &mut keys)?;
            Ok::<_, StorageError>(keys)
        })
        .await
        .map_err(|error| StorageError::Remote(format!("listing task failed: {error}")))??;
        keys.sort();
        Ok(keys)
    }
}

/// In-memory blob store for tests and ephemeral deployments.
#[derive(Debug, Default)]
pub struct MemoryBlobStore {
    blobs: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), StorageError> {
        validate_key(key)?;
        self.blobs().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        validate_key(key)?;
        Ok(self.blobs().get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        validate_key(key)?;
        Ok(self.blobs().remove(key).is_some())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        Ok(self
            .blobs()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_store_put_get_list_delete() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::open(temp.path()).await.expect("open store");

        store
            .put(&job_key("a"), b"{}".to_vec())
            .await
            .expect("put a");
        store
            .put(&index_blob_key("f1"), vec![1, 2, 3])
            .await
            .expect("put index");

        assert_eq!(
            store.get(&job_key("a")).await.expect("get"),
            Some(b"{}".to_vec())
        );
        assert_eq!(store.get(&job_key("missing")).await.expect("get"), None);

        let jobs = store.list(JOBS_PREFIX).await.expect("list jobs");
        assert_eq!(jobs, vec!["jobs/a.json".to_string()]);
        let indexes = store.list(INDEXES_PREFIX).await.expect("list indexes");
        assert_eq!(indexes, vec!["indexes/f1/index.bin".to_string()]);

        assert!(store.delete(&job_key("a")).await.expect("delete"));
        assert!(!store.delete(&job_key("a")).await.expect("delete again"));
    }

    #[tokio::test]
    async fn rejects_traversal_keys() {
        let store = MemoryBlobStore::new();
        for key in ["", "/abs", "../escape", "jobs/../../x", "dir/"] {
            assert!(
                matches!(
                    store.put(key, Vec::new()).await,
                    Err(StorageError::InvalidKey(_))
                ),
                "key {key:?} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn memory_store_lists_by_prefix() {
        let store = MemoryBlobStore::new();
        store.put("jobs/1.json", vec![]).await.expect("put");
        store.put("checkpoints/1.json", vec![]).await.expect("put");
        assert_eq!(
            store.list(JOBS_PREFIX).await.expect("list"),
            vec!["jobs/1.json".to_string()]
        );
        assert!(store.exists("checkpoints/1.json").await.expect("exists"));
    }
}
