#![allow(dead_code)]

use manual_index::checkpoint::CheckpointManager;
use manual_index::embedding::Embedder;
use manual_index::error::InferenceError;
use manual_index::index::{FlatIndex, NearestNeighborIndex};
use manual_index::orchestrator::search::publish_index;
use manual_index::orchestrator::{
    Collaborators, JobOrchestrator, OrchestratorSettings, VectorMetadata,
};
use manual_index::registry::{BlobFileRegistry, FileRecord};
use manual_index::storage::{BlobStore, MemoryBlobStore};
use manual_index::worker::{IndexWorker, TriggerRequest};

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const DIMENSION: usize = 4;

/// Records triggers instead of calling a real worker.
#[derive(Default)]
pub struct FakeWorker {
    pub triggers: Mutex<Vec<TriggerRequest>>,
    pub fail: AtomicBool,
}

impl FakeWorker {
    pub fn triggered(&self) -> Vec<TriggerRequest> {
        self.triggers.lock().expect("triggers").clone()
    }
}

#[async_trait]
impl IndexWorker for FakeWorker {
    async fn trigger(&self, request: &TriggerRequest) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("worker unavailable");
        }
        self.triggers.lock().expect("triggers").push(request.clone());
        Ok(())
    }
}

/// Returns canned vectors per query.
#[derive(Default)]
pub struct FakeEmbedder {
    pub vectors: Mutex<HashMap<String, Vec<f32>>>,
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl FakeEmbedder {
    pub fn set(&self, query: &str, vector: Vec<f32>) {
        self.vectors
            .lock()
            .expect("vectors")
            .insert(query.to_string(), vector);
    }
}

#[async_trait]
impl Embedder for FakeEmbedder {
    async fn embed_text(&self, text: &str) -> manual_index::Result<Vec<f32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(InferenceError::Fatal("embedding API unavailable".into()).into());
        }
        let vectors = self.vectors.lock().expect("vectors");
        Ok(vectors
            .get(text)
            .cloned()
            .unwrap_or_else(|| vec![1.0; DIMENSION]))
    }
}

pub struct Harness {
    pub orchestrator: Arc<JobOrchestrator>,
    pub blobs: Arc<MemoryBlobStore>,
    pub registry: Arc<BlobFileRegistry>,
    pub worker: Arc<FakeWorker>,
    pub embedder: Arc<FakeEmbedder>,
    pub checkpoint_dir: PathBuf,
    pub scratch_dir: PathBuf,
    _temp: tempfile::TempDir,
}

pub fn test_settings() -> OrchestratorSettings {
    let mut settings = OrchestratorSettings::default();
    settings.public_url = "http://orchestrator.test".into();
    settings.dimension = DIMENSION;
    settings
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_settings(test_settings()).await
    }

    pub async fn with_settings(settings: OrchestratorSettings) -> Self {
        Self::with_store(settings, Arc::new(MemoryBlobStore::new())).await
    }

    /// Build a fresh orchestrator over an existing blob store.
    pub async fn with_store(mut settings: OrchestratorSettings, blobs: Arc<MemoryBlobStore>) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let checkpoint_dir = temp.path().join("checkpoints");
        let scratch_dir = temp.path().join("scratch");
        std::fs::create_dir_all(&scratch_dir).expect("scratch dir");
        settings.scratch_dir = Some(scratch_dir.clone());

        let store: Arc<dyn BlobStore> = blobs.clone();
        let registry = Arc::new(BlobFileRegistry::new(store.clone()));
        let worker = Arc::new(FakeWorker::default());
        let embedder = Arc::new(FakeEmbedder::default());
        let checkpoints = CheckpointManager::new(&checkpoint_dir, store.clone())
            .await
            .expect("checkpoints");

        let orchestrator = Arc::new(JobOrchestrator::new(
            Collaborators {
                blobs: store,
                checkpoints,
                registry: registry.clone(),
                worker: worker.clone(),
                embedder: embedder.clone(),
            },
            settings,
        ));

        Self {
            orchestrator,
            blobs,
            registry,
            worker,
            embedder,
            checkpoint_dir,
            scratch_dir,
            _temp: temp,
        }
    }

    pub async fn register(&self, file_id: &str) {
        self.registry
            .register(&FileRecord {
                file_id: file_id.into(),
                file_name: format!("{file_id}.pdf"),
                storage_key: format!("uploads/{file_id}.pdf"),
                content_type: Some("application/pdf".into()),
                uploaded_at: Some(Utc::now()),
            })
            .await
            .expect("register file");
    }

    /// Publish a flat index whose chunk `i` has vector `vectors[i]`.
    pub async fn publish(&self, file_id: &str, vectors: &[Vec<f32>]) {
        let mut index = FlatIndex::new(DIMENSION);
        index.add(vectors).expect("add vectors");
        let metadata: Vec<VectorMetadata> = (0..vectors.len())
            .map(|vector_id| VectorMetadata {
                chunk_id: format!("{file_id}-chunk-{vector_id}"),
                file_id: file_id.into(),
                vector_id,
                content: format!("{file_id} section {vector_id}"),
                start_offset: vector_id * 100,
                end_offset: vector_id * 100 + 99,
                chunk_order: vector_id,
                created_at: Utc::now(),
            })
            .collect();
        publish_index(self.blobs.as_ref(), file_id, &index, &metadata)
            .await
            .expect("publish index");
    }

    pub fn scratch_is_empty(&self) -> bool {
        std::fs::read_dir(&self.scratch_dir)
            .expect("read scratch dir")
            .next()
            .is_none()
    }
}

/// Unit vector along `axis`, optionally tilted toward the next axis.
pub fn axis(axis: usize, tilt: f32) -> Vec<f32> {
    let mut vector = vec![0.0; DIMENSION];
    vector[axis % DIMENSION] = 1.0;
    vector[(axis + 1) % DIMENSION] = tilt;
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    vector.into_iter().map(|x| x / norm).collect()
}

pub async fn settle_briefly() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}
