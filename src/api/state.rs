//! Shared state for the HTTP API.

use crate::orchestrator::JobOrchestrator;

use std::sync::Arc;
use std::time::Instant;

/// State shared across all API handlers.
pub struct ApiState {
    pub orchestrator: Arc<JobOrchestrator>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(orchestrator: Arc<JobOrchestrator>) -> Self {
        Self {
            orchestrator,
            started_at: Instant::now(),
        }
    }
}
