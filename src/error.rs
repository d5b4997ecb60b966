//! Error types shared across the orchestrator.

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested resource is held by another job.
    #[error("lock conflict: {0}")]
    LockConflict(String),

    /// Unknown job or document.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The external indexing worker could not be invoked.
    #[error("failed to trigger indexing worker: {0}")]
    TriggerFailure(String),

    /// No completion callback arrived within the deadline.
    #[error("job {job_id} timed out after {minutes} minutes")]
    Timeout { job_id: String, minutes: u64 },

    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Index artifacts for a document are missing or unreadable.
    #[error("failed to load index for file {file_id}: {source}")]
    IndexLoad {
        file_id: String,
        #[source]
        source: IndexError,
    },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    pub fn job_not_found(job_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "job",
            id: job_id.into(),
        }
    }

    pub fn file_not_found(file_id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: "file",
            id: file_id.into(),
        }
    }
}

/// Embedding API failures.
#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    /// Retryable failure (rate limit, network, upstream 5xx) that persisted
    /// through every attempt.
    #[error("transient inference error after {attempts} attempts: {last_error}")]
    Transient { attempts: u32, last_error: String },

    /// Non-retryable failure (bad request, auth, malformed response).
    #[error("fatal inference error: {0}")]
    Fatal(String),
}

/// Nearest-neighbor index failures.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("index artifact missing: {0}")]
    MissingArtifact(String),

    #[error("corrupt index data: {0}")]
    Corrupt(String),

    #[error("index io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable storage failures.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to (de)serialize record: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("remote storage error: {0}")]
    Remote(String),
}
