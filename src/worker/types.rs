//! Wire types exchanged with the external indexing worker.

use serde::{Deserialize, Serialize};

/// Payload sent to the worker to start building an index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerRequest {
    /// Where the worker can fetch the uploaded document.
    pub storage_location: String,
    pub file_id: String,
    pub file_name: String,
    pub job_id: String,
    /// URL the worker must call with the job outcome.
    pub callback_url: String,
}

/// Build the callback URL for `job_id` under `public_url`.
pub fn callback_url(public_url: &str, job_id: &str) -> String {
    format!(
        "{}/api/jobs/{}/callback",
        public_url.trim_end_matches('/'),
        job_id
    )
}
