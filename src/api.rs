//! HTTP API for job control, worker callbacks, and search.
//!
//! Thin JSON layer over [`JobOrchestrator`](crate::orchestrator::JobOrchestrator).
//! Domain errors map onto status codes in [`ApiError`].

mod error;
mod jobs;
mod search;
mod server;
mod state;

pub use error::ApiError;
pub use server::{router, start_http_server};
pub use state::ApiState;
