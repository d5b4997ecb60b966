//! Durable snapshots of in-flight job state.
//!
//! The local directory is authoritative within a process. Every save is also
//! mirrored to the remote blob store on a best-effort basis so a restarted
//! process can pick up where the previous one stopped.

use crate::error::{Result, StorageError};
use crate::job::{JobProgress, JobStage, JobStatus};
use crate::storage::{BlobStore, CHECKPOINTS_PREFIX, checkpoint_key};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_MAX_AGE_HOURS: u64 = 24;

/// Resumable processing state for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub job_id: String,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress: JobProgress,
    #[serde(default)]
    pub processed_item_ids: Vec<String>,
    /// Index of the last processed item, `-1` before anything ran.
    #[serde(default = "default_last_processed_index")]
    pub last_processed_index: i64,
    #[serde(default)]
    pub retry_count: u32,
    pub last_updated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn default_last_processed_index() -> i64 {
    -1
}

impl Checkpoint {
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
            stage: JobStage::Initialization,
            progress: JobProgress::default(),
            processed_item_ids: Vec::new(),
            last_processed_index: -1,
            retry_count: 0,
            last_updated: Utc::now(),
            error: None,
        }
    }
}

/// Local-first checkpoint storage with a remote mirror.
#[derive(Clone)]
pub struct CheckpointManager {
    local_dir: PathBuf,
    remote: Arc<dyn BlobStore>,
}

impl CheckpointManager {
    pub async fn new(local_dir: impl Into<PathBuf>, remote: Arc<dyn BlobStore>) -> Result<Self> {
        let local_dir = local_dir.into();
        tokio::fs::create_dir_all(&local_dir)
            .await
            .map_err(StorageError::from)?;
        Ok(Self { local_dir, remote })
    }

    pub fn local_dir(&self) -> &Path {
        &self.local_dir
    }

    fn local_path(&self, job_id: &str) -> Result<PathBuf> {
        if job_id.is_empty()
            || job_id.contains(['/', '\\'])
            || job_id == "."
            || job_id == ".."
        {
            return Err(StorageError::InvalidKey(job_id.to_string()).into());
        }
        Ok(self.local_dir.join(format!("{job_id}.json")))
    }

    /// Write locally, then mirror remotely. Remote failures are logged only.
    pub async fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut checkpoint = checkpoint.clone();
        checkpoint.last_updated = Utc::now();
        let data = serde_json::to_vec_pretty(&checkpoint).map_err(StorageError::from)?;

        let path = self.local_path(&checkpoint.job_id)?;
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, &data)
            .await
            .map_err(StorageError::from)?;
        tokio::fs::rename(&temp_path, &path)
            .await
            .map_err(StorageError::from)?;

        if let Err(error) = self
            .remote
            .put(&checkpoint_key(&checkpoint.job_id), data)
            .await
        {
            tracing::warn!(job_id = %checkpoint.job_id, %error, "failed to mirror checkpoint remotely");
        }

        tracing::trace!(job_id = %checkpoint.job_id, stage = %checkpoint.stage, "checkpoint saved");
        Ok(())
    }

    /// Local copy first; the remote copy is used as a fallback and re-cached.
    pub async fn load(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        let path = self.local_path(job_id)?;
        match tokio::fs::read(&path).await {
            Ok(data) => match serde_json::from_slice(&data) {
                Ok(checkpoint) => return Ok(Some(checkpoint)),
                Err(error) => {
                    tracing::warn!(job_id, %error, "local checkpoint unreadable, trying remote copy");
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(StorageError::from(error).into()),
        }

        let Some(data) = self.remote.get(&checkpoint_key(job_id)).await? else {
            return Ok(None);
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&data).map_err(StorageError::from)?;

        if let Err(error) = tokio::fs::write(&path, &data).await {
            tracing::warn!(job_id, %error, "failed to re-cache remote checkpoint locally");
        }
        tracing::debug!(job_id, "checkpoint restored from remote copy");
        Ok(Some(checkpoint))
    }

    pub async fn exists(&self, job_id: &str) -> Result<bool> {
        let path = self.local_path(job_id)?;
        if tokio::fs::try_exists(&path)
            .await
            .map_err(StorageError::from)?
        {
            return Ok(true);
        }
        Ok(self.remote.exists(&checkpoint_key(job_id)).await?)
    }

    /// Remove both copies. Returns whether either existed.
    pub async fn delete(&self, job_id: &str) -> Result<bool> {
        let path = self.local_path(job_id)?;
        let local = match tokio::fs::remove_file(&path).await {
            Ok(()) => true,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => false,
            Err(error) => return Err(StorageError::from(error).into()),
        };
        let remote = match self.remote.delete(&checkpoint_key(job_id)).await {
            Ok(deleted) => deleted,
            Err(error) => {
                tracing::warn!(job_id, %error, "failed to delete remote checkpoint");
                false
            }
        };
        Ok(local || remote)
    }

    /// Job ids with a checkpoint either locally or remotely.
    pub async fn list_all(&self) -> Result<Vec<String>> {
        let mut ids = BTreeSet::new();

        let mut entries = tokio::fs::read_dir(&self.local_dir)
            .await
            .map_err(StorageError::from)?;
        while let Some(entry) = entries.next_entry().await.map_err(StorageError::from)? {
            let name = entry.file_name();
            if let Some(job_id) = name.to_str().and_then(|name| name.strip_suffix(".json")) {
                ids.insert(job_id.to_string());
            }
        }

        match self.remote.list(CHECKPOINTS_PREFIX).await {
            Ok(keys) => {
                for key in keys {
                    if let Some(job_id) = key
                        .strip_prefix(CHECKPOINTS_PREFIX)
                        .and_then(|rest| rest.strip_suffix(".json"))
                    {
                        ids.insert(job_id.to_string());
                    }
                }
            }
            Err(error) => {
                tracing::warn!(%error, "failed to list remote checkpoints");
            }
        }

        Ok(ids.into_iter().collect())
    }

    /// Delete checkpoints not updated within `max_age_hours`. Returns the
    /// number removed.
    pub async fn cleanup_expired(&self, max_age_hours: u64) -> Result<usize> {
        let cutoff = Utc::now() - TimeDelta::hours(max_age_hours.min(i64::MAX as u64) as i64);
        let mut removed = 0;

        for job_id in self.list_all().await? {
            let expired = match self.load(&job_id).await {
                Ok(Some(checkpoint)) => checkpoint.last_updated < cutoff,
                Ok(None) => false,
                Err(error) => {
                    tracing::warn!(job_id, %error, "dropping unreadable checkpoint");
                    true
                }
            };
            if expired && self.delete(&job_id).await? {
                removed += 1;
            }
        }

        if removed > 0 {
            tracing::info!(removed, max_age_hours, "expired checkpoints cleaned up");
        }
        Ok(removed)
    }
}
