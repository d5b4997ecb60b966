use manual_index::api::{ApiState, start_http_server};
use manual_index::checkpoint::CheckpointManager;
use manual_index::config::Config;
use manual_index::embedding::EmbeddingClient;
use manual_index::orchestrator::{Collaborators, JobOrchestrator, OrchestratorSettings};
use manual_index::registry::BlobFileRegistry;
use manual_index::storage::{BlobStore, FsBlobStore};
use manual_index::telemetry;
use manual_index::worker::HttpIndexWorker;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "manual-index")]
#[command(about = "Indexing job orchestrator and semantic search for uploaded manuals")]
#[command(version)]
struct Cli {
    /// Path to config file (default: <config dir>/manual-index/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API and background maintenance
    Serve {
        /// Override the configured bind address
        #[arg(long)]
        bind: Option<SocketAddr>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load config")?;

    let _log_guard = telemetry::init(&config.logging)?;

    match cli.command {
        Command::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind = bind;
            }
            serve(config).await
        }
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let blobs: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::open(&config.storage.data_dir)
            .await
            .with_context(|| format!("failed to open blob store at {}", config.storage.data_dir.display()))?,
    );
    let checkpoints = CheckpointManager::new(config.storage.checkpoint_dir(), blobs.clone())
        .await
        .context("failed to open checkpoint cache")?;

    if config.embedding.api_key.is_none() {
        tracing::warn!("no embedding API key configured, search requests will likely fail");
    }

    let collaborators = Collaborators {
        blobs: blobs.clone(),
        checkpoints,
        registry: Arc::new(BlobFileRegistry::new(blobs)),
        worker: Arc::new(HttpIndexWorker::new(&config.worker)?),
        embedder: Arc::new(EmbeddingClient::new(config.embedding.clone())?),
    };
    let orchestrator = Arc::new(JobOrchestrator::new(
        collaborators,
        OrchestratorSettings::from_config(&config),
    ));

    orchestrator.restore().await.context("failed to restore persisted jobs")?;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let maintenance = orchestrator.spawn_maintenance(shutdown_rx.clone());

    let state = Arc::new(ApiState::new(orchestrator.clone()));
    let (addr, server) = start_http_server(config.server.bind, state, shutdown_rx).await?;
    tracing::info!(%addr, public_url = %config.server.public_url, "manual-index ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("shutting down");

    shutdown_tx.send(true).ok();
    futures::future::join_all(maintenance).await;
    server.await.ok();

    Ok(())
}
