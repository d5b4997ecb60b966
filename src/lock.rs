//! Process-local advisory locks for indexing jobs.
//!
//! One global lock serializes indexing across the whole process, and one lock
//! per document prevents the same file from being indexed twice. Locks carry
//! their owning job and acquisition time; a lock older than the configured
//! timeout counts as abandoned and is reclaimed by the next sweep or acquire.
//!
//! These locks live in memory. They do not survive a restart and do not
//! coordinate multiple running instances.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// Resource key used for the global lock.
pub const GLOBAL_RESOURCE: &str = "*";

/// Default age after which a lock is considered abandoned.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A held lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Lock {
    pub resource_key: String,
    pub job_id: String,
    pub acquired_at: DateTime<Utc>,
    pub owner_identity: String,
}

#[derive(Debug, Default)]
struct LockTable {
    global: Option<Lock>,
    files: HashMap<String, Lock>,
}

/// In-memory lock registry.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    timeout: TimeDelta,
    owner_identity: String,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            timeout: TimeDelta::from_std(timeout).unwrap_or(TimeDelta::MAX),
            owner_identity: format!("pid-{}", std::process::id()),
        }
    }

    fn table(&self) -> std::sync::MutexGuard<'_, LockTable> {
        self.table.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_live(&self, lock: &Lock, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(lock.acquired_at) < self.timeout
    }

    fn new_lock(&self, resource_key: &str, job_id: &str) -> Lock {
        Lock {
            resource_key: resource_key.to_string(),
            job_id: job_id.to_string(),
            acquired_at: Utc::now(),
            owner_identity: self.owner_identity.clone(),
        }
    }

    /// Try to take the global lock for `job_id`.
    pub fn acquire_global(&self, job_id: &str) -> bool {
        self.cleanup_expired();
        let now = Utc::now();
        let mut table = self.table();
        if let Some(existing) = &table.global {
            if self.is_live(existing, now) {
                tracing::debug!(job_id, holder = %existing.job_id, "global lock busy");
                return false;
            }
        }
        table.global = Some(self.new_lock(GLOBAL_RESOURCE, job_id));
        tracing::debug!(job_id, "acquired global lock");
        true
    }

    /// Take the global lock for `job_id`, replacing any holder in the same
    /// critical section. Returns the job that held it, if still live.
    pub fn force_acquire_global(&self, job_id: &str) -> Option<String> {
        let now = Utc::now();
        let mut table = self.table();
        let previous = table
            .global
            .replace(self.new_lock(GLOBAL_RESOURCE, job_id))
            .filter(|lock| self.is_live(lock, now))
            .map(|lock| lock.job_id);
        tracing::debug!(job_id, previous = previous.as_deref().unwrap_or(""), "force acquired global lock");
        previous
    }

    pub fn release_global(&self) {
        if let Some(lock) = self.table().global.take() {
            tracing::debug!(job_id = %lock.job_id, "released global lock");
        }
    }

    /// Release the global lock only if `job_id` still owns it.
    pub fn release_global_for(&self, job_id: &str) -> bool {
        let mut table = self.table();
        if table.global.as_ref().is_some_and(|lock| lock.job_id == job_id) {
            table.global = None;
            tracing::debug!(job_id, "released global lock");
            return true;
        }
        false
    }

    pub fn is_globally_locked(&self) -> bool {
        let now = Utc::now();
        self.table()
            .global
            .as_ref()
            .is_some_and(|lock| self.is_live(lock, now))
    }

    /// Job currently holding the global lock, if any.
    pub fn global_holder(&self) -> Option<String> {
        let now = Utc::now();
        self.table()
            .global
            .as_ref()
            .filter(|lock| self.is_live(lock, now))
            .map(|lock| lock.job_id.clone())
    }

    /// Try to take the lock for `file_id` on behalf of `job_id`.
    pub fn acquire_file(&self, file_id: &str, job_id: &str) -> bool {
        self.cleanup_expired();
        let now = Utc::now();
        let mut table = self.table();
        if let Some(existing) = table.files.get(file_id) {
            if self.is_live(existing, now) {
                tracing::debug!(file_id, job_id, holder = %existing.job_id, "file lock busy");
                return false;
            }
        }
        table
            .files
            .insert(file_id.to_string(), self.new_lock(file_id, job_id));
        tracing::debug!(file_id, job_id, "acquired file lock");
        true
    }

    /// Take the lock for `file_id`, replacing any holder atomically.
    pub fn force_acquire_file(&self, file_id: &str, job_id: &str) -> Option<String> {
        let now = Utc::now();
        let mut table = self.table();
        let previous = table
            .files
            .insert(file_id.to_string(), self.new_lock(file_id, job_id))
            .filter(|lock| self.is_live(lock, now))
            .map(|lock| lock.job_id);
        tracing::debug!(file_id, job_id, previous = previous.as_deref().unwrap_or(""), "force acquired file lock");
        previous
    }

    pub fn release_file(&self, file_id: &str) {
        if let Some(lock) = self.table().files.remove(file_id) {
            tracing::debug!(file_id, job_id = %lock.job_id, "released file lock");
        }
    }

    /// Release the lock on `file_id` only if `job_id` still owns it.
    pub fn release_file_for(&self, file_id: &str, job_id: &str) -> bool {
        let mut table = self.table();
        if table
            .files
            .get(file_id)
            .is_some_and(|lock| lock.job_id == job_id)
        {
            table.files.remove(file_id);
            tracing::debug!(file_id, job_id, "released file lock");
            return true;
        }
        false
    }

    pub fn is_file_locked(&self, file_id: &str) -> bool {
        let now = Utc::now();
        self.table()
            .files
            .get(file_id)
            .is_some_and(|lock| self.is_live(lock, now))
    }

    pub fn file_holder(&self, file_id: &str) -> Option<String> {
        let now = Utc::now();
        self.table()
            .files
            .get(file_id)
            .filter(|lock| self.is_live(lock, now))
            .map(|lock| lock.job_id.clone())
    }

    /// Drop every lock older than the timeout. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Utc::now();
        let mut table = self.table();
        let mut removed = 0;

        let global_expired = table
            .global
            .as_ref()
            .is_some_and(|lock| !self.is_live(lock, now));
        if global_expired {
            if let Some(lock) = table.global.take() {
                tracing::warn!(job_id = %lock.job_id, "expired abandoned global lock");
            }
            removed += 1;
        }

        let before = table.files.len();
        table.files.retain(|file_id, lock| {
            let live = now.signed_duration_since(lock.acquired_at) < self.timeout;
            if !live {
                tracing::warn!(file_id = %file_id, job_id = %lock.job_id, "expired abandoned file lock");
            }
            live
        });
        removed += before - table.files.len();
        removed
    }

    /// Drop every lock regardless of age.
    pub fn force_release_all(&self) {
        let mut table = self.table();
        let count = table.files.len() + usize::from(table.global.is_some());
        table.global = None;
        table.files.clear();
        tracing::warn!(count, "force released all locks");
    }

    /// Current live locks, global first.
    pub fn snapshot(&self) -> Vec<Lock> {
        let now = Utc::now();
        let table = self.table();
        let mut files: Vec<Lock> = table
            .files
            .values()
            .filter(|lock| self.is_live(lock, now))
            .cloned()
            .collect();
        files.sort_by(|a, b| a.resource_key.cmp(&b.resource_key));

        let mut locks: Vec<Lock> = table
            .global
            .iter()
            .filter(|lock| self.is_live(lock, now))
            .cloned()
            .collect();
        locks.extend(files);
        locks
    }
}
