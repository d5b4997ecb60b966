//! Manual index: orchestrates semantic indexing jobs for uploaded documents
//! and serves nearest-neighbor search over the finished indexes.

pub mod api;
pub mod checkpoint;
pub mod config;
pub mod embedding;
pub mod error;
pub mod index;
pub mod job;
pub mod lock;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use config::Config;
pub use error::{Error, Result};
pub use job::{Job, JobMetrics, JobStage, JobStatus};
pub use orchestrator::{Collaborators, JobOrchestrator, OrchestratorSettings, ProgressUpdate};
