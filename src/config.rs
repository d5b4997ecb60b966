//! Runtime configuration.
//!
//! Loaded from an optional TOML file layered with `MANUAL_INDEX__SECTION__KEY`
//! environment overrides. Secrets may be written as `env:VAR_NAME` and are
//! resolved at load time.

use crate::error::{Error, Result};

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const ENV_PREFIX: &str = "MANUAL_INDEX";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub worker: WorkerConfig,
    pub embedding: EmbeddingConfig,
    pub search: SearchConfig,
    pub limits: LimitsConfig,
    pub logging: LoggingConfig,
}

/// Inbound HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: SocketAddr,
    /// Externally reachable base URL, used to build worker callback addresses.
    pub public_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
            public_url: "http://127.0.0.1:8787".to_string(),
        }
    }
}

/// Where durable state lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root of the blob store (jobs, registry, index artifacts).
    pub data_dir: PathBuf,
    /// Local checkpoint cache. Defaults to `<data_dir>/../checkpoint-cache`.
    pub checkpoint_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("manual-index");
        Self {
            data_dir: base.join("blobs"),
            checkpoint_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint_dir.clone().unwrap_or_else(|| {
            self.data_dir
                .parent()
                .unwrap_or(&self.data_dir)
                .join("checkpoint-cache")
        })
    }
}

/// External indexing worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// URL the trigger request is POSTed to.
    pub endpoint: String,
    /// Bearer token. Supports `env:VAR_NAME`.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8788/index".to_string(),
            api_key: None,
            timeout_secs: 30,
        }
    }
}

/// Hosted embedding API (OpenAI-compatible `/embeddings`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub base_url: String,
    /// Supports `env:VAR_NAME`.
    pub api_key: Option<String>,
    pub model: String,
    /// Expected vector dimension; must match the index artifacts.
    pub dimensions: usize,
    pub batch_size: usize,
    pub max_attempts: u32,
    /// Texts are truncated to this many characters before embedding.
    pub max_text_chars: usize,
    /// First backoff after a rate-limit response; doubles per attempt.
    pub rate_limit_backoff_ms: u64,
    /// Fixed delay after a transient network failure.
    pub transient_retry_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            api_key: Some("env:OPENAI_API_KEY".to_string()),
            model: "text-embedding-3-small".to_string(),
            dimensions: 1536,
            batch_size: 100,
            max_attempts: 3,
            max_text_chars: 8000,
            rate_limit_backoff_ms: 1000,
            transient_retry_delay_ms: 1000,
            timeout_secs: 30,
        }
    }
}

/// Which nearest-neighbor implementation serves searches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    #[default]
    Flat,
    Hnsw,
}

/// Search defaults and index tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub index_kind: IndexKind,
    pub default_k: usize,
    pub default_min_score: f32,
    /// Default threshold for federated search across every document.
    pub federated_min_score: f32,
    pub hnsw_m: usize,
    pub hnsw_ef_construction: usize,
    pub hnsw_ef_search: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            index_kind: IndexKind::Flat,
            default_k: 5,
            default_min_score: 0.0,
            federated_min_score: 0.5,
            hnsw_m: 16,
            hnsw_ef_construction: 200,
            hnsw_ef_search: 50,
        }
    }
}

/// Timeouts, retention windows, and sweep intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub lock_timeout_secs: u64,
    pub job_timeout_secs: u64,
    pub job_retention_hours: u64,
    pub checkpoint_max_age_hours: u64,
    pub lock_sweep_secs: u64,
    pub checkpoint_sweep_secs: u64,
    pub retention_sweep_secs: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            lock_timeout_secs: 60 * 60,
            job_timeout_secs: 15 * 60,
            job_retention_hours: 24,
            checkpoint_max_age_hours: 24,
            lock_sweep_secs: 60,
            checkpoint_sweep_secs: 60 * 60,
            retention_sweep_secs: 24 * 60 * 60,
        }
    }
}

impl LimitsConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_hours * 60 * 60)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Directory for daily-rotated log files. Stdout only when unset.
    pub log_dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "manual_index=info,tower_http=info".to_string(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("manual-index").join("config.toml"))
    }

    /// Load from `path` (or the default location) plus environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let file = path.map(Path::to_path_buf).or_else(Self::default_path);
        if let Some(file) = &file {
            // An explicitly requested file must exist.
            builder = builder.add_source(config::File::from(file.as_path()).required(path.is_some()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let mut config: Config = builder
            .build()
            .and_then(|raw| raw.try_deserialize())
            .map_err(|error| Error::Config(error.to_string()))?;

        config.resolve_secrets()?;
        config.validate()?;
        Ok(config)
    }

    fn resolve_secrets(&mut self) -> Result<()> {
        self.worker.api_key = resolve_env_reference(self.worker.api_key.take())?;
        self.embedding.api_key = resolve_env_reference(self.embedding.api_key.take())?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.embedding.dimensions == 0 {
            return Err(Error::Config("embedding.dimensions must be positive".into()));
        }
        if self.embedding.batch_size == 0 {
            return Err(Error::Config("embedding.batch_size must be positive".into()));
        }
        if self.embedding.max_attempts == 0 {
            return Err(Error::Config("embedding.max_attempts must be positive".into()));
        }
        if self.search.hnsw_m < 2 {
            return Err(Error::Config("search.hnsw_m must be at least 2".into()));
        }
        Ok(())
    }
}

/// Resolve `env:VAR_NAME` to the variable's value. A missing variable yields
/// `None` so optional credentials stay optional.
fn resolve_env_reference(value: Option<String>) -> Result<Option<String>> {
    let Some(value) = value else {
        return Ok(None);
    };
    let Some(var) = value.strip_prefix("env:") else {
        return Ok(Some(value));
    };
    if var.is_empty() {
        return Err(Error::Config("empty env: reference".into()));
    }
    match std::env::var(var) {
        Ok(resolved) if !resolved.trim().is_empty() => Ok(Some(resolved)),
        _ => {
            tracing::debug!(var, "referenced environment variable is unset");
            Ok(None)
        }
    }
}
