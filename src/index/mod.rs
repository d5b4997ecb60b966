//! Nearest-neighbor indexes over document chunk embeddings.
//!
//! Two interchangeable implementations share [`NearestNeighborIndex`]:
//! [`FlatIndex`] (exact inner product) and [`HnswIndex`] (approximate graph
//! search). Both read and write the same on-disk blob: gzip-compressed JSON
//! holding the raw vectors and, for HNSW, the navigation graph. A flat index
//! can load an HNSW blob and vice versa; HNSW rebuilds its graph when the
//! blob carries none.

pub mod flat;
pub mod hnsw;

use crate::config::{IndexKind, SearchConfig};
use crate::error::IndexError;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

pub use flat::FlatIndex;
pub use hnsw::{HnswIndex, HnswParams};

/// Ids and scores of the nearest vectors, best first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchHits {
    pub ids: Vec<usize>,
    pub scores: Vec<f32>,
}

impl SearchHits {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.ids.iter().copied().zip(self.scores.iter().copied())
    }
}

/// Summary of an index's contents.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub kind: IndexKind,
    pub dimension: usize,
    pub num_vectors: usize,
    /// Approximate heap footprint of vectors plus graph links.
    pub memory_bytes: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_level: Option<usize>,
}

/// Shared contract of the flat and graph indexes.
pub trait NearestNeighborIndex: Send + Sync {
    fn kind(&self) -> IndexKind;

    fn dimension(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append vectors; ids continue from the current length.
    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError>;

    /// Top `k` by inner product. `k` is clamped to the vector count.
    fn search(&self, query: &[f32], k: usize) -> Result<SearchHits, IndexError>;

    /// Replace contents with the blob at `path`.
    fn load(&mut self, path: &Path) -> Result<(), IndexError>;

    fn save(&self, path: &Path) -> Result<(), IndexError>;

    fn stats(&self) -> IndexStats;

    fn clear(&mut self);
}

/// Construct an empty index of the configured kind.
pub fn new_index(kind: IndexKind, dimension: usize, search: &SearchConfig) -> Box<dyn NearestNeighborIndex> {
    match kind {
        IndexKind::Flat => Box::new(FlatIndex::new(dimension)),
        IndexKind::Hnsw => Box::new(HnswIndex::new(
            dimension,
            HnswParams::new(search.hnsw_m)
                .with_ef_construction(search.hnsw_ef_construction)
                .with_ef_search(search.hnsw_ef_search),
        )),
    }
}

/// Serialized navigation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct GraphData {
    pub entry_point: Option<usize>,
    pub max_level: usize,
    pub m: usize,
    pub ef_construction: usize,
    /// `neighbors[node][layer]` lists the node's links on that layer.
    pub neighbors: Vec<Vec<Vec<usize>>>,
}

/// On-disk index blob.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct IndexFile {
    pub kind: IndexKind,
    pub dimension: usize,
    pub vectors: Vec<Vec<f32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub graph: Option<GraphData>,
}

impl IndexFile {
    pub fn read(path: &Path, expected_dimension: usize) -> Result<Self, IndexError> {
        let file = File::open(path).map_err(|error| match error.kind() {
            std::io::ErrorKind::NotFound => IndexError::MissingArtifact(path.display().to_string()),
            _ => IndexError::Io(error),
        })?;
        let decoder = GzDecoder::new(BufReader::new(file));
        let index_file: IndexFile = serde_json::from_reader(decoder)
            .map_err(|error| IndexError::Corrupt(format!("{}: {error}", path.display())))?;

        if index_file.dimension != expected_dimension {
            return Err(IndexError::DimensionMismatch {
                expected: expected_dimension,
                actual: index_file.dimension,
            });
        }
        if let Some(position) = index_file
            .vectors
            .iter()
            .position(|vector| vector.len() != expected_dimension)
        {
            return Err(IndexError::Corrupt(format!(
                "vector {position} has {} components, expected {expected_dimension}",
                index_file.vectors[position].len()
            )));
        }
        Ok(index_file)
    }

    pub fn write(&self, path: &Path) -> Result<(), IndexError> {
        let file = File::create(path)?;
        let mut encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        serde_json::to_writer(&mut encoder, self)
            .map_err(|error| IndexError::Corrupt(error.to_string()))?;
        let mut writer = encoder.finish()?;
        writer.flush()?;
        Ok(())
    }
}

pub(crate) fn check_dimension(expected: usize, vector: &[f32]) -> Result<(), IndexError> {
    if vector.len() != expected {
        return Err(IndexError::DimensionMismatch {
            expected,
            actual: vector.len(),
        });
    }
    Ok(())
}

#[inline]
pub(crate) fn inner_product(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}
