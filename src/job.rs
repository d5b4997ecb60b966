//! Indexing job records, their lifecycle, and durable persistence.

use crate::error::StorageError;
use crate::storage::{BlobStore, JOBS_PREFIX, job_key};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Price of one second of worker compute, in USD.
pub const WORKER_COST_PER_SECOND: f64 = 0.000_020;
/// Price of one embedded token, in USD.
pub const EMBEDDING_COST_PER_TOKEN: f64 = 0.000_000_011;

/// Lifecycle state of an indexing job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Indexing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Indexing => 1,
            Self::Completed | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Transitions only move forward and never leave a terminal state.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Indexing => "indexing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Processing phase within a job, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Initialization,
    Extraction,
    Embedding,
    IndexBuilding,
    Metadata,
    Upload,
    Completed,
}

impl JobStage {
    /// Working stages in order, excluding the terminal `Completed` marker.
    pub const ORDERED: [JobStage; 6] = [
        JobStage::Initialization,
        JobStage::Extraction,
        JobStage::Embedding,
        JobStage::IndexBuilding,
        JobStage::Metadata,
        JobStage::Upload,
    ];

    /// Share of overall progress this stage accounts for. Weights sum to 100.
    pub fn weight(self) -> f64 {
        match self {
            Self::Initialization => 5.0,
            Self::Extraction => 15.0,
            Self::Embedding => 60.0,
            Self::IndexBuilding => 10.0,
            Self::Metadata => 5.0,
            Self::Upload => 5.0,
            Self::Completed => 0.0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initialization => "initialization",
            Self::Extraction => "extraction",
            Self::Embedding => "embedding",
            Self::IndexBuilding => "index_building",
            Self::Metadata => "metadata",
            Self::Upload => "upload",
            Self::Completed => "completed",
        }
    }
}

impl std::fmt::Display for JobStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Progress counters reported on a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobProgress {
    pub current: u64,
    pub total: u64,
    pub percentage: f64,
    /// Estimated seconds remaining.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eta: Option<f64>,
}

impl JobProgress {
    pub fn complete() -> Self {
        Self {
            current: 100,
            total: 100,
            percentage: 100.0,
            eta: None,
        }
    }
}

/// Statistics reported by the worker alongside a successful callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Metrics carried by a completion callback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMetrics {
    /// Worker wall time in seconds.
    #[serde(default)]
    pub processing_time: Option<f64>,
    #[serde(default)]
    pub num_chunks: Option<u64>,
    #[serde(default)]
    pub num_vectors: Option<u64>,
    #[serde(default)]
    pub stats: Option<IndexingStats>,
}

impl JobMetrics {
    /// True when the callback carried none of the metric fields.
    pub fn is_empty(&self) -> bool {
        self.processing_time.is_none()
            && self.num_chunks.is_none()
            && self.num_vectors.is_none()
            && self.stats.is_none()
    }
}

/// Estimated cost of a job, in USD. Informational, not billing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobCosts {
    pub worker: f64,
    pub embedding: f64,
    pub total: f64,
}

impl JobCosts {
    pub fn from_metrics(metrics: &JobMetrics) -> Self {
        let seconds = metrics.processing_time.unwrap_or(0.0).max(0.0);
        let tokens = metrics
            .stats
            .as_ref()
            .and_then(|stats| stats.total_tokens)
            .unwrap_or(0);
        let worker = seconds * WORKER_COST_PER_SECOND;
        let embedding = tokens as f64 * EMBEDDING_COST_PER_TOKEN;
        Self {
            worker,
            embedding,
            total: worker + embedding,
        }
    }
}

/// One request to build a semantic index for a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub job_id: String,
    pub file_id: String,
    pub file_name: String,
    pub status: JobStatus,
    pub stage: JobStage,
    pub progress: JobProgress,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_time: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_chunks: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_vectors: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<IndexingStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub costs: Option<JobCosts>,
}

impl Job {
    pub fn new(
        job_id: impl Into<String>,
        file_id: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            job_id: job_id.into(),
            file_id: file_id.into(),
            file_name: file_name.into(),
            status: JobStatus::Pending,
            stage: JobStage::Initialization,
            progress: JobProgress::default(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            processing_time: None,
            num_chunks: None,
            num_vectors: None,
            stats: None,
            costs: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to `status`/`stage` if the lifecycle allows it.
    pub fn advance(&mut self, status: JobStatus, stage: JobStage) -> bool {
        if !self.status.can_transition_to(status) {
            return false;
        }
        self.status = status;
        self.stage = stage;
        self.updated_at = Utc::now();
        true
    }

    pub fn complete(&mut self, metrics: Option<&JobMetrics>) -> bool {
        if !self.advance(JobStatus::Completed, JobStage::Completed) {
            return false;
        }
        self.progress = JobProgress::complete();
        self.completed_at = Some(self.updated_at);
        self.error = None;
        if let Some(metrics) = metrics {
            self.processing_time = metrics.processing_time;
            self.num_chunks = metrics.num_chunks;
            self.num_vectors = metrics.num_vectors;
            self.stats = metrics.stats.clone();
            self.costs = Some(JobCosts::from_metrics(metrics));
        }
        true
    }

    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        let stage = self.stage;
        if !self.advance(JobStatus::Failed, stage) {
            return false;
        }
        self.error = Some(error.into());
        self.completed_at = Some(self.updated_at);
        true
    }

    pub fn cancel(&mut self) -> bool {
        let stage = self.stage;
        if !self.advance(JobStatus::Cancelled, stage) {
            return false;
        }
        self.completed_at = Some(self.updated_at);
        true
    }

    /// Whether a still-running job has outlived `timeout` since creation.
    pub fn is_stalled(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        if self.is_terminal() || self.completed_at.is_some() {
            return false;
        }
        let timeout = TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX);
        now.signed_duration_since(self.created_at) > timeout
    }
}

/// Persists job records as JSON blobs under `jobs/`.
#[derive(Clone)]
pub struct JobStore {
    store: Arc<dyn BlobStore>,
}

impl JobStore {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    pub async fn save(&self, job: &Job) -> Result<(), StorageError> {
        let data = serde_json::to_vec_pretty(job)?;
        self.store.put(&job_key(&job.job_id), data).await
    }

    pub async fn delete(&self, job_id: &str) -> Result<bool, StorageError> {
        self.store.delete(&job_key(job_id)).await
    }

    /// Load every persisted job newer than `retention`.
    ///
    /// Expired records are deleted; unreadable ones are logged and skipped.
    pub async fn load_all(&self, retention: Duration) -> Result<Vec<Job>, StorageError> {
        let cutoff = Utc::now() - TimeDelta::from_std(retention).unwrap_or(TimeDelta::MAX);
        let keys = self.store.list(JOBS_PREFIX).await?;
        let mut jobs = Vec::with_capacity(keys.len());

        for key in keys {
            let Some(data) = self.store.get(&key).await? else {
                continue;
            };
            let job: Job = match serde_json::from_slice(&data) {
                Ok(job) => job,
                Err(error) => {
                    tracing::warn!(%key, %error, "skipping unreadable job record");
                    continue;
                }
            };
            if job.created_at < cutoff {
                if let Err(error) = self.store.delete(&key).await {
                    tracing::warn!(%key, %error, "failed to delete expired job record");
                }
                continue;
            }
            jobs.push(job);
        }

        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(jobs)
    }
}
