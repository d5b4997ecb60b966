//! Approximate nearest-neighbor search over a Hierarchical Navigable Small
//! World graph.
//!
//! Nodes are assigned a random top layer from an exponential distribution;
//! upper layers are sparse express lanes and layer 0 links every node. Search
//! descends greedily through the upper layers and then runs a beam search of
//! width `ef_search` on layer 0. Similarity is the inner product, so "closer"
//! means a higher score.

use super::{
    GraphData, IndexFile, IndexStats, NearestNeighborIndex, SearchHits, check_dimension,
    inner_product,
};
use crate::config::IndexKind;
use crate::error::IndexError;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashSet};
use std::path::Path;

const MAX_LEVEL: usize = 16;
const DEFAULT_SEED: u64 = 0x5eed_1dea;

/// Construction and search breadth.
#[derive(Debug, Clone, PartialEq)]
pub struct HnswParams {
    /// Links per node on upper layers.
    pub m: usize,
    /// Links per node on layer 0.
    pub m_max0: usize,
    /// Beam width while inserting.
    pub ef_construction: usize,
    /// Beam width while searching.
    pub ef_search: usize,
    /// Level multiplier, `1 / ln(m)`.
    pub ml: f64,
    pub seed: u64,
}

impl HnswParams {
    pub fn new(m: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            m_max0: m * 2,
            ef_construction: 200,
            ef_search: 50,
            ml: 1.0 / (m as f64).ln(),
            seed: DEFAULT_SEED,
        }
    }

    pub fn with_ef_construction(mut self, ef: usize) -> Self {
        self.ef_construction = ef.max(1);
        self
    }

    pub fn with_ef_search(mut self, ef: usize) -> Self {
        self.ef_search = ef.max(1);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }
}

impl Default for HnswParams {
    fn default() -> Self {
        Self::new(16)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    score: f32,
    id: usize,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.id.cmp(&self.id))
    }
}

pub struct HnswIndex {
    dimension: usize,
    params: HnswParams,
    vectors: Vec<Vec<f32>>,
    /// `neighbors[node][layer]`.
    neighbors: Vec<Vec<Vec<usize>>>,
    entry_point: Option<usize>,
    max_level: usize,
    rng: StdRng,
}

impl std::fmt::Debug for HnswIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HnswIndex")
            .field("dimension", &self.dimension)
            .field("params", &self.params)
            .field("len", &self.vectors.len())
            .field("entry_point", &self.entry_point)
            .field("max_level", &self.max_level)
            .finish()
    }
}

impl HnswIndex {
    pub fn new(dimension: usize, params: HnswParams) -> Self {
        let rng = StdRng::seed_from_u64(params.seed);
        Self {
            dimension,
            params,
            vectors: Vec::new(),
            neighbors: Vec::new(),
            entry_point: None,
            max_level: 0,
            rng,
        }
    }

    pub fn params(&self) -> &HnswParams {
        &self.params
    }

    fn random_level(&mut self) -> usize {
        // Uniform in (0, 1] so ln() stays finite.
        let uniform = 1.0 - self.rng.random::<f64>();
        let level = (-uniform.ln() * self.params.ml).floor() as usize;
        level.min(MAX_LEVEL)
    }

    fn score(&self, query: &[f32], id: usize) -> f32 {
        inner_product(query, &self.vectors[id])
    }

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.params.m_max0
        } else {
            self.params.m
        }
    }

    /// Beam search on one layer. Returns up to `ef` nodes, best first.
    fn search_layer(&self, query: &[f32], entry_points: &[usize], ef: usize, layer: usize) -> Vec<Scored> {
        let mut visited: HashSet<usize> = entry_points.iter().copied().collect();
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();

        for &id in entry_points {
            let scored = Scored {
                score: self.score(query, id),
                id,
            };
            candidates.push(scored);
            results.push(Reverse(scored));
            if results.len() > ef {
                results.pop();
            }
        }

        while let Some(candidate) = candidates.pop() {
            let worst = results.peek().map(|Reverse(worst)| worst.score);
            if results.len() >= ef && worst.is_some_and(|worst| candidate.score < worst) {
                break;
            }

            let Some(links) = self.neighbors[candidate.id].get(layer) else {
                continue;
            };
            for &neighbor in links {
                if !visited.insert(neighbor) {
                    continue;
                }
                let scored = Scored {
                    score: self.score(query, neighbor),
                    id: neighbor,
                };
                let worst = results.peek().map(|Reverse(worst)| worst.score);
                if results.len() < ef || worst.is_some_and(|worst| scored.score > worst) {
                    candidates.push(scored);
                    results.push(Reverse(scored));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut found: Vec<Scored> = results.into_iter().map(|Reverse(scored)| scored).collect();
        found.sort_by(|a, b| b.cmp(a));
        found
    }

    /// Greedy descent from the top layer down to `target_layer + 1`.
    fn descend(&self, query: &[f32], target_layer: usize) -> Option<usize> {
        let mut current = self.entry_point?;
        let mut layer = self.max_level;
        while layer > target_layer {
            let best = self.search_layer(query, &[current], 1, layer);
            if let Some(best) = best.first() {
                current = best.id;
            }
            layer -= 1;
        }
        Some(current)
    }

    fn insert(&mut self, id: usize) {
        let level = self.random_level();
        self.neighbors.push(vec![Vec::new(); level + 1]);

        let Some(entry) = self.entry_point else {
            self.entry_point = Some(id);
            self.max_level = level;
            return;
        };

        let query = self.vectors[id].clone();
        let mut entry_points = vec![if level < self.max_level {
            self.descend(&query, level).unwrap_or(entry)
        } else {
            entry
        }];

        for layer in (0..=level.min(self.max_level)).rev() {
            let found = self.search_layer(&query, &entry_points, self.params.ef_construction, layer);
            let selected: Vec<usize> = found
                .iter()
                .filter(|scored| scored.id != id)
                .take(self.params.m)
                .map(|scored| scored.id)
                .collect();

            self.neighbors[id][layer] = selected.clone();
            for &neighbor in &selected {
                self.neighbors[neighbor][layer].push(id);
                self.prune(neighbor, layer);
            }

            entry_points = found.iter().map(|scored| scored.id).collect();
            if entry_points.is_empty() {
                entry_points.push(entry);
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(id);
        }
    }

    /// Keep only the best-scoring links of `node` on `layer`.
    fn prune(&mut self, node: usize, layer: usize) {
        let limit = self.max_links(layer);
        if self.neighbors[node][layer].len() <= limit {
            return;
        }
        let base = &self.vectors[node];
        let mut links: Vec<Scored> = self.neighbors[node][layer]
            .iter()
            .map(|&id| Scored {
                score: inner_product(base, &self.vectors[id]),
                id,
            })
            .collect();
        links.sort_by(|a, b| b.cmp(a));
        links.truncate(limit);
        self.neighbors[node][layer] = links.into_iter().map(|scored| scored.id).collect();
    }

    fn rebuild(&mut self) {
        self.neighbors.clear();
        self.entry_point = None;
        self.max_level = 0;
        self.rng = StdRng::seed_from_u64(self.params.seed);
        for id in 0..self.vectors.len() {
            self.insert(id);
        }
    }

    /// A stored graph is usable only if search over it is bounded: the level
    /// count is capped, the entry point spans every level, and no node sits
    /// above it.
    fn graph_is_consistent(&self, graph: &GraphData, count: usize) -> bool {
        let layer_count = graph.max_level + 1;
        graph.max_level <= MAX_LEVEL
            && graph.neighbors.len() == count
            && (count == 0) == graph.entry_point.is_none()
            && graph.entry_point.is_none_or(|entry| {
                graph
                    .neighbors
                    .get(entry)
                    .is_some_and(|layers| layers.len() == layer_count)
            })
            && graph.neighbors.iter().all(|layers| {
                !layers.is_empty()
                    && layers.len() <= layer_count
                    && layers.iter().flatten().all(|&id| id < count)
            })
    }
}

impl NearestNeighborIndex for HnswIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Hnsw
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
        for vector in vectors {
            self.vectors.push(vector.clone());
            self.insert(self.vectors.len() - 1);
        }
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Result<SearchHits, IndexError> {
        check_dimension(self.dimension, query)?;
        let k = k.min(self.vectors.len());
        if k == 0 {
            return Ok(SearchHits::default());
        }
        let Some(entry) = self.descend(query, 0) else {
            return Ok(SearchHits::default());
        };

        let ef = self.params.ef_search.max(k);
        let mut found = self.search_layer(query, &[entry], ef, 0);
        found.truncate(k);

        Ok(SearchHits {
            ids: found.iter().map(|scored| scored.id).collect(),
            scores: found.iter().map(|scored| scored.score).collect(),
        })
    }

    fn load(&mut self, path: &Path) -> Result<(), IndexError> {
        let file = IndexFile::read(path, self.dimension)?;
        let count = file.vectors.len();
        self.vectors = file.vectors;

        match file.graph {
            Some(graph) if self.graph_is_consistent(&graph, count) => {
                if graph.m != self.params.m {
                    tracing::debug!(
                        stored_m = graph.m,
                        stored_ef_construction = graph.ef_construction,
                        configured_m = self.params.m,
                        "using stored graph built with different parameters"
                    );
                }
                self.neighbors = graph.neighbors;
                self.entry_point = graph.entry_point;
                self.max_level = graph.max_level;
                tracing::debug!(path = %path.display(), vectors = count, "hnsw graph loaded");
            }
            graph => {
                if graph.is_some() {
                    tracing::warn!(path = %path.display(), "stored hnsw graph is inconsistent, rebuilding");
                }
                self.rebuild();
                tracing::debug!(path = %path.display(), vectors = count, "hnsw graph built on load");
            }
        }
        Ok(())
    }

    fn save(&self, path: &Path) -> Result<(), IndexError> {
        IndexFile {
            kind: IndexKind::Hnsw,
            dimension: self.dimension,
            vectors: self.vectors.clone(),
            graph: Some(GraphData {
                entry_point: self.entry_point,
                max_level: self.max_level,
                m: self.params.m,
                ef_construction: self.params.ef_construction,
                neighbors: self.neighbors.clone(),
            }),
        }
        .write(path)
    }

    fn stats(&self) -> IndexStats {
        let links: usize = self
            .neighbors
            .iter()
            .flat_map(|layers| layers.iter().map(Vec::len))
            .sum();
        IndexStats {
            kind: IndexKind::Hnsw,
            dimension: self.dimension,
            num_vectors: self.vectors.len(),
            memory_bytes: self.vectors.len() * self.dimension * std::mem::size_of::<f32>()
                + links * std::mem::size_of::<usize>(),
            max_level: Some(self.max_level),
        }
    }

    fn clear(&mut self) {
        self.vectors.clear();
        self.neighbors.clear();
        self.entry_point = None;
        self.max_level = 0;
        self.rng = StdRng::seed_from_u64(self.params.seed);
    }
}
