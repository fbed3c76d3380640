//! In-memory vector index with cosine distance search.
//!
//! Holds one entry per product-name chunk. Distances are `1 - cos(q, v)`
//! in `[0, 2]`, lower is closer.

/// A product-name chunk and its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexChunk {
    /// Catalog product the chunk was cut from
    pub product_name: String,
    /// The embedded text
    pub text: String,
    pub embedding: Vec<f32>,
}

/// A chunk matched by a query.
#[derive(Debug, Clone, Copy)]
pub struct SearchHit<'a> {
    pub chunk: &'a IndexChunk,
    pub distance: f32,
}

pub struct VectorIndex {
    chunks: Vec<IndexChunk>,
    /// Cached L2 norms, parallel to `chunks`
    norms: Vec<f32>,
    dimensions: usize,
}

impl std::fmt::Debug for VectorIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VectorIndex")
            .field("dimensions", &self.dimensions)
            .field("len", &self.chunks.len())
            .finish()
    }
}

impl VectorIndex {
    pub fn new(dimensions: usize) -> Self {
        Self::with_capacity(dimensions, 0)
    }

    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            chunks: Vec::with_capacity(capacity),
            norms: Vec::with_capacity(capacity),
            dimensions,
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn chunks(&self) -> &[IndexChunk] {
        &self.chunks
    }

    /// Append a chunk.
    ///
    /// Returns an error if the embedding has zero norm (cannot be normalized).
    pub fn insert(&mut self, chunk: IndexChunk) -> Result<(), IndexError> {
        if chunk.embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: chunk.embedding.len(),
            });
        }

        let norm = l2_norm(&chunk.embedding);
        if norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        self.norms.push(norm);
        self.chunks.push(chunk);

        Ok(())
    }

    /// Up to `k` nearest chunks, sorted by ascending distance.
    ///
    /// Ties keep insertion order so identical inputs give identical results.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit<'_>>, IndexError> {
        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut hits: Vec<SearchHit<'_>> = self
            .chunks
            .iter()
            .zip(&self.norms)
            .map(|(chunk, norm)| {
                let dot: f32 = query.iter().zip(&chunk.embedding).map(|(a, b)| a * b).sum();
                let cosine = (dot / (query_norm * norm)).clamp(-1.0, 1.0);
                SearchHit {
                    chunk,
                    distance: 1.0 - cosine,
                }
            })
            .collect();

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);

        Ok(hits)
    }
}

fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,
}
