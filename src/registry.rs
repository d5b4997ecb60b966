//! Uploaded-file registry.
//!
//! Maps a file id to the storage location the worker reads the document
//! from. Records live in the blob store under `files/{fileId}.json`.

use crate::error::{Result, StorageError};
use crate::storage::{BlobStore, file_record_key};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_id: String,
    pub file_name: String,
    /// Location handed to the worker, e.g. an object-store key.
    pub storage_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_at: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait FileRegistry: Send + Sync {
    /// Look up a file. `Ok(None)` when it was never registered.
    async fn resolve(&self, file_id: &str) -> Result<Option<FileRecord>>;
}

/// Registry backed by JSON records in a [`BlobStore`].
pub struct BlobFileRegistry {
    store: Arc<dyn BlobStore>,
}

impl BlobFileRegistry {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn register(&self, record: &FileRecord) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(record).map_err(StorageError::from)?;
        self.store.put(&file_record_key(&record.file_id), bytes).await?;
        Ok(())
    }
}

#[async_trait]
impl FileRegistry for BlobFileRegistry {
    async fn resolve(&self, file_id: &str) -> Result<Option<FileRecord>> {
        let Some(bytes) = self.store.get(&file_record_key(file_id)).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&bytes).map_err(StorageError::from)?;
        Ok(Some(record))
    }
}
