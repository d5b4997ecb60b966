//! Semantic search over per-document index artifacts.
//!
//! Each indexed document has an index blob and a metadata array in the blob
//! store. A search copies the blob into a request-scoped temp file, loads it
//! into a [`NearestNeighborIndex`], and maps hit ids back through the
//! metadata array, where `metadata[i].vector_id == i`.

use super::JobOrchestrator;
use crate::error::{Error, IndexError, Result, StorageError};
use crate::index::{NearestNeighborIndex, new_index};
use crate::storage::{BlobStore, INDEXES_PREFIX, index_blob_key, index_metadata_key};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::Write as _;

/// One entry of a document's metadata array, describing a stored chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VectorMetadata {
    pub chunk_id: String,
    pub file_id: String,
    /// Position of the chunk's vector in the index.
    pub vector_id: usize,
    pub content: String,
    #[serde(default)]
    pub start_offset: usize,
    #[serde(default)]
    pub end_offset: usize,
    #[serde(default)]
    pub chunk_order: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResult {
    pub chunk_id: String,
    pub file_id: String,
    pub content: String,
    pub score: f32,
    pub metadata: VectorMetadata,
}

impl SearchResult {
    fn from_metadata(metadata: &VectorMetadata, score: f32) -> Self {
        Self {
            chunk_id: metadata.chunk_id.clone(),
            file_id: metadata.file_id.clone(),
            content: metadata.content.clone(),
            score,
            metadata: metadata.clone(),
        }
    }
}

/// Parameters of a single-document search. Unset fields use configured defaults.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub file_id: String,
    pub query: String,
    #[serde(default)]
    pub k: Option<usize>,
    #[serde(default)]
    pub min_score: Option<f32>,
}

impl JobOrchestrator {
    /// Top matches for `request.query` within one document.
    ///
    /// Never returns a result scoring below the threshold. Missing or
    /// unreadable artifacts fail with [`Error::IndexLoad`].
    pub async fn search_vector(&self, request: &SearchRequest) -> Result<Vec<SearchResult>> {
        let k = request.k.unwrap_or(self.settings.search.default_k);
        let min_score = request
            .min_score
            .unwrap_or(self.settings.search.default_min_score);
        self.search_document(&request.file_id, &request.query, k, min_score)
            .await
    }

    /// Federated search across every document with a completed index.
    ///
    /// Failures in individual documents are logged and skipped.
    pub async fn search_all_manuals(
        &self,
        query: &str,
        k: Option<usize>,
        min_score: Option<f32>,
    ) -> Result<Vec<SearchResult>> {
        let k = k.unwrap_or(self.settings.search.default_k);
        let min_score = min_score.unwrap_or(self.settings.search.federated_min_score);
        if query.trim().is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        let file_ids = indexed_files(self.blobs.as_ref()).await?;
        if file_ids.is_empty() {
            return Ok(Vec::new());
        }

        let per_document = k.div_ceil(file_ids.len()) + 2;
        let mut results = Vec::new();
        for file_id in &file_ids {
            match self
                .search_document(file_id, query, per_document, min_score)
                .await
            {
                Ok(hits) => results.extend(hits),
                Err(error) => {
                    tracing::warn!(file_id = %file_id, %error, "skipping document in federated search");
                }
            }
        }

        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(k);

        tracing::debug!(
            documents = file_ids.len(),
            per_document,
            returned = results.len(),
            "federated search finished"
        );
        Ok(results)
    }

    async fn search_document(
        &self,
        file_id: &str,
        query: &str,
        k: usize,
        min_score: f32,
    ) -> Result<Vec<SearchResult>> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let load_error = |source: IndexError| Error::IndexLoad {
            file_id: file_id.to_string(),
            source,
        };

        let blob = self
            .blobs
            .get(&index_blob_key(file_id))
            .await?
            .ok_or_else(|| load_error(IndexError::MissingArtifact(index_blob_key(file_id))))?;
        let raw_metadata = self
            .blobs
            .get(&index_metadata_key(file_id))
            .await?
            .ok_or_else(|| load_error(IndexError::MissingArtifact(index_metadata_key(file_id))))?;
        let metadata = parse_metadata(&raw_metadata).map_err(load_error)?;

        let index = self.load_index(blob).await.map_err(load_error)?;
        if index.len() != metadata.len() {
            tracing::warn!(
                file_id,
                vectors = index.len(),
                metadata = metadata.len(),
                "index and metadata sizes differ"
            );
        }

        let embedding = self.embedder.embed_text(query).await?;
        let hits = index.search(&embedding, k.min(index.len()))?;

        let mut results = Vec::with_capacity(hits.len());
        for (vector_id, score) in hits.iter() {
            if score < min_score {
                continue;
            }
            match metadata.get(vector_id) {
                Some(entry) => results.push(SearchResult::from_metadata(entry, score)),
                None => tracing::warn!(file_id, vector_id, "hit has no metadata entry"),
            }
        }
        Ok(results)
    }

    /// Materialize `blob` in a temp file and load it. The file is removed
    /// when this returns, whether or not loading succeeded.
    async fn load_index(
        &self,
        blob: Vec<u8>,
    ) -> std::result::Result<Box<dyn NearestNeighborIndex>, IndexError> {
        let kind = self.settings.search.index_kind;
        let dimension = self.settings.dimension;
        let search = self.settings.search.clone();
        let scratch_dir = self.settings.scratch_dir.clone();

        tokio::task::spawn_blocking(move || -> std::result::Result<_, IndexError> {
            let mut builder = tempfile::Builder::new();
            builder.prefix("manual-index-").suffix(".bin");
            let mut temp = match &scratch_dir {
                Some(dir) => builder.tempfile_in(dir)?,
                None => builder.tempfile()?,
            };
            temp.write_all(&blob)?;
            temp.flush()?;

            let mut index = new_index(kind, dimension, &search);
            index.load(temp.path())?;
            Ok(index)
        })
        .await
        .map_err(|error| IndexError::Io(std::io::Error::other(error)))?
    }
}

fn parse_metadata(raw: &[u8]) -> std::result::Result<Vec<VectorMetadata>, IndexError> {
    let metadata: Vec<VectorMetadata> = serde_json::from_slice(raw)
        .map_err(|error| IndexError::Corrupt(format!("metadata: {error}")))?;
    if let Some((position, entry)) = metadata
        .iter()
        .enumerate()
        .find(|(position, entry)| entry.vector_id != *position)
    {
        return Err(IndexError::Corrupt(format!(
            "metadata entry {position} has vectorId {}",
            entry.vector_id
        )));
    }
    Ok(metadata)
}

/// File ids that have both an index blob and a metadata array.
pub async fn indexed_files(store: &dyn BlobStore) -> std::result::Result<Vec<String>, StorageError> {
    let keys: BTreeSet<String> = store.list(INDEXES_PREFIX).await?.into_iter().collect();
    let file_ids = keys
        .iter()
        .filter_map(|key| key.strip_prefix(INDEXES_PREFIX))
        .filter_map(|rest| rest.split_once('/'))
        .map(|(file_id, _)| file_id.to_string())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .filter(|file_id| {
            keys.contains(&index_blob_key(file_id)) && keys.contains(&index_metadata_key(file_id))
        })
        .collect();
    Ok(file_ids)
}

/// Publish a document's index and metadata to the blob store.
pub async fn publish_index(
    store: &dyn BlobStore,
    file_id: &str,
    index: &dyn NearestNeighborIndex,
    metadata: &[VectorMetadata],
) -> Result<()> {
    if index.len() != metadata.len() {
        return Err(IndexError::Corrupt(format!(
            "{} vectors but {} metadata entries",
            index.len(),
            metadata.len()
        ))
        .into());
    }

    let temp = tempfile::Builder::new()
        .prefix("manual-index-")
        .suffix(".bin")
        .tempfile()
        .map_err(IndexError::from)?;
    index.save(temp.path())?;
    let blob = tokio::fs::read(temp.path()).await.map_err(IndexError::from)?;
    let metadata = serde_json::to_vec(metadata).map_err(StorageError::from)?;

    store.put(&index_metadata_key(file_id), metadata).await?;
    store.put(&index_blob_key(file_id), blob).await?;
    tracing::info!(file_id, vectors = index.len(), "index published");
    Ok(())
}
