//! Stage-weighted progress and ETA tracking for a single job.

use crate::job::{JobProgress, JobStage, JobStatus};

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::{Duration, Instant};

/// Point-in-time view of a job's progress.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressSnapshot {
    pub job_id: String,
    pub stage: JobStage,
    pub status: JobStatus,
    pub current: u64,
    pub total: u64,
    /// Overall completion across all stages, 0–100.
    pub percentage: f64,
    pub eta: Option<Duration>,
    pub elapsed: Duration,
    pub stage_elapsed: Duration,
}

impl ProgressSnapshot {
    pub fn to_job_progress(&self) -> JobProgress {
        JobProgress {
            current: self.current,
            total: self.total,
            percentage: (self.percentage * 100.0).round() / 100.0,
            eta: self.eta.map(|eta| eta.as_secs_f64().round()),
        }
    }
}

/// Callback invoked on every progress update.
pub type ProgressObserver = Box<dyn Fn(&ProgressSnapshot) + Send + Sync>;

/// Tracks one job's progress through its weighted stages.
pub struct ProgressTracker {
    job_id: String,
    total_items: u64,
    current_items: u64,
    current_stage: JobStage,
    current_status: JobStatus,
    start_time: Instant,
    stage_start_time: Instant,
    observers: Vec<ProgressObserver>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("job_id", &self.job_id)
            .field("total_items", &self.total_items)
            .field("current_items", &self.current_items)
            .field("current_stage", &self.current_stage)
            .field("current_status", &self.current_status)
            .field("observers", &self.observers.len())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new(job_id: impl Into<String>, total_items: u64) -> Self {
        let now = Instant::now();
        Self {
            job_id: job_id.into(),
            total_items,
            current_items: 0,
            current_stage: JobStage::Initialization,
            current_status: JobStatus::Pending,
            start_time: now,
            stage_start_time: now,
            observers: Vec::new(),
        }
    }

    pub fn on_progress(&mut self, observer: impl Fn(&ProgressSnapshot) + Send + Sync + 'static) {
        self.observers.push(Box::new(observer));
    }

    pub fn stage(&self) -> JobStage {
        self.current_stage
    }

    /// Enter a new stage. Item counters restart from zero.
    pub fn set_stage(&mut self, stage: JobStage, status: JobStatus) {
        self.current_stage = stage;
        self.current_status = status;
        self.current_items = 0;
        self.stage_start_time = Instant::now();
        self.notify();
    }

    pub fn set_total(&mut self, total_items: u64) {
        self.total_items = total_items;
        self.notify();
    }

    /// Set the absolute number of items processed within the current stage.
    pub fn update(&mut self, current_items: u64) {
        self.current_items = current_items;
        self.notify();
    }

    pub fn increment(&mut self, by: u64) {
        self.current_items = self.current_items.saturating_add(by);
        self.notify();
    }

    pub fn complete(&mut self) {
        self.current_stage = JobStage::Completed;
        self.current_status = JobStatus::Completed;
        self.current_items = self.total_items;
        self.notify();
    }

    pub fn get_progress(&self) -> ProgressSnapshot {
        let elapsed = self.start_time.elapsed();
        let percentage =
            stage_percentage(self.current_stage, self.current_items, self.total_items);
        ProgressSnapshot {
            job_id: self.job_id.clone(),
            stage: self.current_stage,
            status: self.current_status,
            current: self.current_items,
            total: self.total_items,
            percentage,
            eta: estimate_remaining(elapsed, percentage),
            elapsed,
            stage_elapsed: self.stage_start_time.elapsed(),
        }
    }

    fn notify(&self) {
        if self.observers.is_empty() {
            return;
        }
        let snapshot = self.get_progress();
        for observer in &self.observers {
            if catch_unwind(AssertUnwindSafe(|| observer(&snapshot))).is_err() {
                tracing::warn!(job_id = %self.job_id, "progress observer panicked");
            }
        }
    }
}

/// Overall percentage: weights of finished stages plus the current stage's
/// weight scaled by its item fraction, clamped to 100.
pub fn stage_percentage(stage: JobStage, current: u64, total: u64) -> f64 {
    if stage == JobStage::Completed {
        return 100.0;
    }
    let finished: f64 = JobStage::ORDERED
        .iter()
        .filter(|candidate| **candidate < stage)
        .map(|candidate| candidate.weight())
        .sum();
    let fraction = if total == 0 {
        0.0
    } else {
        (current as f64 / total as f64).min(1.0)
    };
    (finished + stage.weight() * fraction).min(100.0)
}

/// Linear extrapolation: `elapsed * (100 / percentage) - elapsed`.
pub fn estimate_remaining(elapsed: Duration, percentage: f64) -> Option<Duration> {
    if percentage <= 0.0 {
        return None;
    }
    if percentage >= 100.0 {
        return Some(Duration::ZERO);
    }
    let elapsed_secs = elapsed.as_secs_f64();
    let remaining = elapsed_secs * (100.0 / percentage) - elapsed_secs;
    Some(Duration::from_secs_f64(remaining.max(0.0)))
}
