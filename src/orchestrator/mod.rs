//! Job orchestration: locking, the indexing job lifecycle, and search.
//!
//! One [`JobOrchestrator`] is built at startup and shared behind an `Arc`.
//! In-memory state sits behind `std::sync` locks that are never held across
//! an `.await`; durable state goes through the [`JobStore`] and the
//! [`CheckpointManager`].

mod maintenance;
pub mod search;

pub use search::{SearchResult, VectorMetadata};

use crate::checkpoint::{Checkpoint, CheckpointManager};
use crate::config::{Config, SearchConfig};
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::job::{Job, JobMetrics, JobStage, JobStatus, JobStore};
use crate::lock::LockManager;
use crate::progress::ProgressTracker;
use crate::registry::FileRegistry;
use crate::storage::BlobStore;
use crate::worker::types::callback_url;
use crate::worker::{IndexWorker, TriggerRequest};

use chrono::{TimeDelta, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

/// Tunables the orchestrator needs from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Base URL the worker uses to reach the completion callback.
    pub public_url: String,
    pub lock_timeout: Duration,
    pub job_timeout: Duration,
    pub job_retention: Duration,
    pub checkpoint_max_age_hours: u64,
    /// Dimension of every stored index and query embedding.
    pub dimension: usize,
    pub search: SearchConfig,
    /// Where request-scoped index copies are written. System temp dir when unset.
    pub scratch_dir: Option<PathBuf>,
    pub lock_sweep: Duration,
    pub checkpoint_sweep: Duration,
    pub retention_sweep: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            public_url: config.server.public_url.clone(),
            lock_timeout: config.limits.lock_timeout(),
            job_timeout: config.limits.job_timeout(),
            job_retention: config.limits.job_retention(),
            checkpoint_max_age_hours: config.limits.checkpoint_max_age_hours,
            dimension: config.embedding.dimensions,
            search: config.search.clone(),
            scratch_dir: None,
            lock_sweep: Duration::from_secs(config.limits.lock_sweep_secs.max(1)),
            checkpoint_sweep: Duration::from_secs(config.limits.checkpoint_sweep_secs.max(1)),
            retention_sweep: Duration::from_secs(config.limits.retention_sweep_secs.max(1)),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// External collaborators, injected so tests can substitute fakes.
pub struct Collaborators {
    pub blobs: Arc<dyn BlobStore>,
    pub checkpoints: CheckpointManager,
    pub registry: Arc<dyn FileRegistry>,
    pub worker: Arc<dyn IndexWorker>,
    pub embedder: Arc<dyn Embedder>,
}

/// Progress report pushed by the worker while it runs.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub stage: JobStage,
    pub current: u64,
    pub total: u64,
    #[serde(default)]
    pub processed_item_ids: Vec<String>,
    #[serde(default)]
    pub last_processed_index: Option<i64>,
}

/// Outcome of a guarded terminal transition.
enum Settled {
    /// This caller won the transition and released the job's locks.
    Applied(Job),
    /// The job was already terminal (or not eligible); nothing changed.
    Unchanged(Job),
}

pub struct JobOrchestrator {
    jobs: RwLock<HashMap<String, Job>>,
    trackers: Mutex<HashMap<String, ProgressTracker>>,
    locks: LockManager,
    job_store: JobStore,
    /// Serializes job-store writes so the newest in-memory state lands last.
    persist_gate: tokio::sync::Mutex<()>,
    blobs: Arc<dyn BlobStore>,
    checkpoints: CheckpointManager,
    registry: Arc<dyn FileRegistry>,
    worker: Arc<dyn IndexWorker>,
    embedder: Arc<dyn Embedder>,
    settings: OrchestratorSettings,
}

impl std::fmt::Debug for JobOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobOrchestrator")
            .field("jobs", &self.read_jobs().len())
            .field("locks", &self.locks)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl JobOrchestrator {
    pub fn new(collaborators: Collaborators, settings: OrchestratorSettings) -> Self {
        let Collaborators {
            blobs,
            checkpoints,
            registry,
            worker,
            embedder,
        } = collaborators;
        Self {
            jobs: RwLock::new(HashMap::new()),
            trackers: Mutex::new(HashMap::new()),
            locks: LockManager::new(settings.lock_timeout),
            job_store: JobStore::new(blobs.clone()),
            persist_gate: tokio::sync::Mutex::new(()),
            blobs,
            checkpoints,
            registry,
            worker,
            embedder,
            settings,
        }
    }

    pub fn locks(&self) -> &LockManager {
        &self.locks
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, HashMap<String, Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_jobs(&self) -> RwLockWriteGuard<'_, HashMap<String, Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn trackers(&self) -> MutexGuard<'_, HashMap<String, ProgressTracker>> {
        self.trackers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reload persisted jobs within the retention window.
    ///
    /// Locks do not survive a restart, so unfinished jobs take theirs back.
    /// The newest unfinished job gets the global lock.
    pub async fn restore(&self) -> Result<usize> {
        let jobs = self.job_store.load_all(self.settings.job_retention).await?;
        let count = jobs.len();

        for job in jobs.iter().rev().filter(|job| !job.is_terminal()) {
            self.locks.acquire_file(&job.file_id, &job.job_id);
            self.locks.acquire_global(&job.job_id);
        }

        let mut map = self.write_jobs();
        for job in jobs {
            map.entry(job.job_id.clone()).or_insert(job);
        }
        drop(map);

        tracing::info!(count, "restored persisted jobs");
        Ok(count)
    }

    /// Start indexing `file_id`. Returns the new job id.
    ///
    /// Fails with [`Error::LockConflict`] when another job holds the global
    /// or file lock and `force_rebuild` is off. A worker that cannot be
    /// triggered does not fail the call: the job is recorded as failed and
    /// its id is still returned.
    pub async fn start_indexing(
        &self,
        file_id: &str,
        file_name: &str,
        force_rebuild: bool,
    ) -> Result<String> {
        self.locks.cleanup_expired();

        let job_id = Uuid::new_v4().to_string();
        if force_rebuild {
            if let Some(holder) = self.locks.force_acquire_global(&job_id) {
                tracing::warn!(file_id, holder = %holder, "force rebuild took over global lock");
            }
            if let Some(holder) = self.locks.force_acquire_file(file_id, &job_id) {
                tracing::warn!(file_id, holder = %holder, "force rebuild took over file lock");
            }
        } else {
            if let Some(holder) = self.locks.global_holder() {
                return Err(Error::LockConflict(format!(
                    "another indexing job is in progress ({holder})"
                )));
            }
            if let Some(holder) = self.locks.file_holder(file_id) {
                return Err(Error::LockConflict(format!(
                    "file {file_id} is already being indexed ({holder})"
                )));
            }
            if !self.locks.acquire_global(&job_id) {
                return Err(Error::LockConflict(
                    "failed to acquire global indexing lock".into(),
                ));
            }
            if !self.locks.acquire_file(file_id, &job_id) {
                self.locks.release_global_for(&job_id);
                return Err(Error::LockConflict(format!(
                    "failed to acquire lock for file {file_id}"
                )));
            }
        }

        let job = Job::new(&job_id, file_id, file_name);
        self.write_jobs().insert(job_id.clone(), job);
        if let Err(error) = self.persist(&job_id).await {
            self.write_jobs().remove(&job_id);
            self.locks.release_file_for(file_id, &job_id);
            self.locks.release_global_for(&job_id);
            return Err(error);
        }

        tracing::info!(%job_id, file_id, file_name, force_rebuild, "indexing job created");

        let record = match self.registry.resolve(file_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                self.fail_and_persist(&job_id, format!("file {file_id} is not registered"))
                    .await;
                return Err(Error::file_not_found(file_id));
            }
            Err(error) => {
                self.fail_and_persist(&job_id, error.to_string()).await;
                return Err(error);
            }
        };

        let request = TriggerRequest {
            storage_location: record.storage_key,
            file_id: file_id.to_string(),
            file_name: file_name.to_string(),
            job_id: job_id.clone(),
            callback_url: callback_url(&self.settings.public_url, &job_id),
        };

        if let Err(error) = self.worker.trigger(&request).await {
            let error = Error::TriggerFailure(format!("{error:#}"));
            tracing::error!(%job_id, file_id, %error, "indexing worker trigger failed");
            self.fail_and_persist(&job_id, error.to_string()).await;
            return Ok(job_id);
        }

        let advanced = self
            .write_jobs()
            .get_mut(&job_id)
            .is_some_and(|job| job.advance(JobStatus::Indexing, JobStage::IndexBuilding));
        if advanced {
            if let Err(error) = self.persist(&job_id).await {
                tracing::warn!(%job_id, %error, "failed to persist indexing job");
            }
        }

        Ok(job_id)
    }

    /// Look up a job, failing it first if it has stalled past the job timeout.
    pub async fn get_job(&self, job_id: &str) -> Result<Job> {
        let now = Utc::now();
        let stalled = self
            .read_jobs()
            .get(job_id)
            .map(|job| job.is_stalled(now, self.settings.job_timeout))
            .ok_or_else(|| Error::job_not_found(job_id))?;

        if stalled {
            self.expire(job_id).await;
        }

        self.read_jobs()
            .get(job_id)
            .cloned()
            .ok_or_else(|| Error::job_not_found(job_id))
    }

    /// All known jobs, newest first, with stalled ones failed.
    pub async fn list_jobs(&self) -> Vec<Job> {
        self.sweep_stalled().await;

        let mut jobs: Vec<Job> = self.read_jobs().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Apply the worker's completion callback.
    ///
    /// Only the first callback for a job takes effect. Repeats, and callbacks
    /// for jobs already cancelled or timed out, return the job unchanged.
    pub async fn update_job_from_callback(
        &self,
        job_id: &str,
        success: bool,
        error: Option<String>,
        metrics: Option<JobMetrics>,
    ) -> Result<Job> {
        let settled = self
            .settle(job_id, |job| {
                if success {
                    job.complete(metrics.as_ref())
                } else {
                    job.fail(error.unwrap_or_else(|| "indexing worker reported failure".into()))
                }
            })
            .await?;

        match settled {
            Settled::Unchanged(job) => {
                tracing::info!(job_id, status = %job.status, "ignoring callback for finished job");
                Ok(job)
            }
            Settled::Applied(job) => {
                tracing::info!(
                    job_id,
                    file_id = %job.file_id,
                    status = %job.status,
                    error = job.error.as_deref().unwrap_or(""),
                    "indexing job finished"
                );
                self.persist(job_id).await?;
                Ok(job)
            }
        }
    }

    /// Cancel a running job. `false` if unknown or already finished.
    ///
    /// Dispatched worker activity is not aborted; its eventual callback is
    /// ignored.
    pub async fn cancel_job(&self, job_id: &str) -> Result<bool> {
        match self.settle(job_id, Job::cancel).await {
            Ok(Settled::Applied(job)) => {
                tracing::info!(job_id, file_id = %job.file_id, "indexing job cancelled");
                self.persist(job_id).await?;
                Ok(true)
            }
            Ok(Settled::Unchanged(_)) | Err(Error::NotFound { .. }) => Ok(false),
            Err(error) => Err(error),
        }
    }

    /// Record a progress report from the worker and checkpoint it.
    ///
    /// A job that finishes while the report is being applied keeps neither a
    /// tracker nor a checkpoint.
    pub async fn record_progress(&self, job_id: &str, update: ProgressUpdate) -> Result<Job> {
        // Applies the lazy timeout before anything is recorded.
        self.get_job(job_id).await?;

        let job = {
            let mut jobs = self.write_jobs();
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::job_not_found(job_id))?;
            if job.is_terminal() {
                tracing::debug!(job_id, status = %job.status, "ignoring progress for finished job");
                return Ok(job.clone());
            }

            // Created under the job map lock, so `settle` cannot miss it.
            let snapshot = {
                let mut trackers = self.trackers();
                let tracker = trackers
                    .entry(job_id.to_string())
                    .or_insert_with(|| new_tracker(job_id, update.total));
                if tracker.stage() != update.stage {
                    tracker.set_stage(update.stage, JobStatus::Indexing);
                }
                tracker.set_total(update.total);
                tracker.update(update.current);
                tracker.get_progress()
            };

            if !job.advance(JobStatus::Indexing, update.stage) {
                return Ok(job.clone());
            }
            job.progress = snapshot.to_job_progress();
            job.clone()
        };

        let mut checkpoint = match self.checkpoints.load(job_id).await {
            Ok(Some(checkpoint)) => checkpoint,
            Ok(None) => Checkpoint::new(job_id),
            Err(error) => {
                tracing::warn!(job_id, %error, "starting a fresh checkpoint");
                Checkpoint::new(job_id)
            }
        };
        checkpoint.status = job.status;
        checkpoint.stage = job.stage;
        checkpoint.progress = job.progress.clone();
        for item_id in update.processed_item_ids {
            if !checkpoint.processed_item_ids.contains(&item_id) {
                checkpoint.processed_item_ids.push(item_id);
            }
        }
        checkpoint.last_processed_index = update
            .last_processed_index
            .unwrap_or(update.current as i64 - 1);

        if !self.is_finished(job_id) {
            if let Err(error) = self.checkpoints.save(&checkpoint).await {
                tracing::warn!(job_id, %error, "failed to save checkpoint");
            }
            // A terminal transition that landed during the save has already
            // deleted its checkpoint; drop the one just written.
            if self.is_finished(job_id) {
                if let Err(error) = self.checkpoints.delete(job_id).await {
                    tracing::warn!(job_id, %error, "failed to delete checkpoint of finished job");
                }
            }
        }

        self.persist(job_id).await?;
        Ok(self.read_jobs().get(job_id).cloned().unwrap_or(job))
    }

    fn is_finished(&self, job_id: &str) -> bool {
        self.read_jobs().get(job_id).is_none_or(Job::is_terminal)
    }

    /// Latest checkpoint for a job, if one was recorded.
    pub async fn checkpoint(&self, job_id: &str) -> Result<Option<Checkpoint>> {
        self.checkpoints.load(job_id).await
    }

    /// Drop finished jobs created before the retention window.
    pub async fn cleanup_old_jobs(&self) -> Result<usize> {
        self.sweep_stalled().await;

        let retention = TimeDelta::from_std(self.settings.job_retention).unwrap_or(TimeDelta::MAX);
        let cutoff = Utc::now() - retention;
        let expired: Vec<String> = self
            .read_jobs()
            .values()
            .filter(|job| job.is_terminal() && job.created_at < cutoff)
            .map(|job| job.job_id.clone())
            .collect();

        let _gate = self.persist_gate.lock().await;
        for job_id in &expired {
            self.write_jobs().remove(job_id);
            self.trackers().remove(job_id);
            self.job_store.delete(job_id).await?;
            if let Err(error) = self.checkpoints.delete(job_id).await {
                tracing::warn!(%job_id, %error, "failed to delete checkpoint of expired job");
            }
        }

        if !expired.is_empty() {
            tracing::info!(removed = expired.len(), "expired jobs cleaned up");
        }
        Ok(expired.len())
    }

    /// Fail every job that has outlived the job timeout.
    async fn sweep_stalled(&self) {
        let now = Utc::now();
        let stalled: Vec<String> = self
            .read_jobs()
            .values()
            .filter(|job| job.is_stalled(now, self.settings.job_timeout))
            .map(|job| job.job_id.clone())
            .collect();

        for job_id in stalled {
            self.expire(&job_id).await;
        }
    }

    async fn expire(&self, job_id: &str) {
        let now = Utc::now();
        let timeout = self.settings.job_timeout;
        let message = Error::Timeout {
            job_id: job_id.to_string(),
            minutes: timeout.as_secs() / 60,
        }
        .to_string();

        let settled = self
            .settle(job_id, |job| job.is_stalled(now, timeout) && job.fail(message))
            .await;
        if let Ok(Settled::Applied(job)) = settled {
            tracing::warn!(job_id, file_id = %job.file_id, "job timed out waiting for completion callback");
            if let Err(error) = self.persist(job_id).await {
                tracing::warn!(job_id, %error, "failed to persist timed out job");
            }
        }
    }

    async fn fail_and_persist(&self, job_id: &str, message: String) {
        if let Ok(Settled::Applied(_)) = self.settle(job_id, |job| job.fail(message)).await {
            if let Err(error) = self.persist(job_id).await {
                tracing::warn!(job_id, %error, "failed to persist failed job");
            }
        }
    }

    /// Run a terminal transition under the job map's write lock.
    ///
    /// The caller whose transition succeeds releases the job's locks and
    /// drops its progress state; everyone else sees [`Settled::Unchanged`].
    async fn settle<F>(&self, job_id: &str, transition: F) -> Result<Settled>
    where
        F: FnOnce(&mut Job) -> bool + Send,
    {
        let (job, applied) = {
            let mut jobs = self.write_jobs();
            let job = jobs
                .get_mut(job_id)
                .ok_or_else(|| Error::job_not_found(job_id))?;
            let applied = transition(job);
            (job.clone(), applied)
        };

        if !applied {
            return Ok(Settled::Unchanged(job));
        }

        let global = self.locks.release_global_for(&job.job_id);
        let file = self.locks.release_file_for(&job.file_id, &job.job_id);
        tracing::debug!(job_id, global, file, "released job locks");

        self.trackers().remove(job_id);
        if let Err(error) = self.checkpoints.delete(job_id).await {
            tracing::warn!(job_id, %error, "failed to delete checkpoint");
        }
        Ok(Settled::Applied(job))
    }

    /// Write the current in-memory state of a job to the job store.
    async fn persist(&self, job_id: &str) -> Result<()> {
        let _gate = self.persist_gate.lock().await;
        let Some(job) = self.read_jobs().get(job_id).cloned() else {
            return Ok(());
        };
        self.job_store.save(&job).await?;
        Ok(())
    }
}

fn new_tracker(job_id: &str, total: u64) -> ProgressTracker {
    let mut tracker = ProgressTracker::new(job_id, total);
    tracker.on_progress(|snapshot| {
        tracing::debug!(
            job_id = %snapshot.job_id,
            stage = %snapshot.stage,
            current = snapshot.current,
            total = snapshot.total,
            percentage = snapshot.percentage,
            "indexing progress"
        );
    });
    tracker
}
