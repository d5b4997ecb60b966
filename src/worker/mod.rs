//! External indexing worker.
//!
//! Index construction runs out of process. The orchestrator fires a trigger
//! carrying the document location and a callback address, and the worker
//! reports back through the completion callback when it finishes. The
//! trigger only reports acceptance, never the job outcome.

pub mod trigger;
pub mod types;

pub use trigger::{HttpIndexWorker, IndexWorker};
pub use types::TriggerRequest;
