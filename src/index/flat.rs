//! Exact brute-force inner-product index.

use super::{IndexFile, IndexStats, NearestNeighborIndex, SearchHits, check_dimension, inner_product};
use crate::config::IndexKind;
use crate::error::IndexError;

use std::path::Path;

#[derive(Debug, Clone)]
pub struct FlatIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            vectors: Vec::new(),
        }
    }
}

impl NearestNeighborIndex for FlatIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Flat
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn add(&mut self, vectors: &[Vec<f32>]) -> Result<(), IndexError> {
        for vector in vectors {
            check_dimension(self.dimension, vector)?;
        }
        self.vectors.extend_from_slice(vectors);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<SearchHits, IndexError> {
        check_dimension(self.dimension, query)?;
        let k = k.min(self.vectors.len());
        if k == 0 {
            return Ok(SearchHits::default());
        }

        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(id, vector)| (id, inner_product(query, vector)))
            .collect();
        // Ties break toward the lower id so results are stable.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        scored.truncate(k);

        Ok(SearchHits {
            ids: scored.iter().map(|(id, _)| *id).collect(),
            scores: scored.iter().map(|(_, score)| *score).collect(),
        })
    }

    fn load(&mut self, path: &Path) -> Result<(), IndexError> {
        let file = IndexFile::read(path, self.dimension)?;
        self.vectors = file.vectors;
        tracing::debug!(path = %path.display(), vectors = self.vectors.len(), "flat index loaded");
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), IndexError> {
        IndexFile {
            kind: IndexKind::Flat,
            dimension: self.dimension,
            vectors: self.vectors.clone(),
            graph: None,
        }
        .write(path)
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            kind: IndexKind::Flat,
            dimension: self.dimension,
            num_vectors: self.vectors.len(),
            memory_bytes: self.vectors.len() * self.dimension * std::mem::size_of::<f32>(),
            max_level: None,
        }
    }

    fn clear(&mut self) {
        self.vectors.clear();
    }
}
