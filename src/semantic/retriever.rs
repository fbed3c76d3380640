//! Candidate retrieval: nearest chunks for a query, deduplicated and
//! optionally cut at a distance threshold.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::config::SearchConfig;
use crate::provider::ProviderError;
use crate::retry::{RetryError, RetryPolicy};
use crate::semantic::embeddings::Embedder;
use crate::semantic::index::{IndexError, SearchHit, VectorIndex};
use crate::semantic::service::{IndexLifecycleError, VectorIndexHandle};

#[derive(Debug, thiserror::Error)]
pub enum RetrievalError {
    #[error(transparent)]
    Index(#[from] IndexLifecycleError),

    #[error("query embedding failed: {0}")]
    Embedding(#[from] RetryError<ProviderError>),

    #[error("search failed: {0}")]
    Search(#[from] IndexError),
}

impl RetrievalError {
    pub fn retry_error(&self) -> Option<&RetryError<ProviderError>> {
        match self {
            RetrievalError::Embedding(err) => Some(err),
            RetrievalError::Index(err) => err.retry_error(),
            RetrievalError::Search(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetrieverOptions {
    /// Raw hits requested from the index before dedup
    pub k: usize,
    pub enable_score_filter: bool,
    /// Maximum cosine distance kept when the filter is on
    pub score_threshold: f32,
}

impl RetrieverOptions {
    pub fn from_config(config: &SearchConfig) -> Self {
        Self {
            k: config.k,
            enable_score_filter: config.enable_score_filter,
            score_threshold: config.score_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub product_name: String,
    pub distance: f32,
}

pub struct Retriever {
    index: Arc<VectorIndexHandle>,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    options: RetrieverOptions,
}

impl Retriever {
    pub fn new(
        index: Arc<VectorIndexHandle>,
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
        options: RetrieverOptions,
    ) -> Self {
        Self {
            index,
            embedder,
            retry,
            options,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndexHandle> {
        &self.index
    }

    /// Candidates for `query`, best first. An empty list means no match.
    pub fn search(
        &self,
        query: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let index = self.index.ensure_ready()?;
        self.search_in(&index, query, deadline)
    }

    /// Same as [`search`](Self::search) against an index the caller already holds.
    pub fn search_in(
        &self,
        index: &VectorIndex,
        query: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<Candidate>, RetrievalError> {
        let query = query.trim();
        if query.is_empty() || index.is_empty() {
            return Ok(vec![]);
        }

        let embedding = self.retry.run(
            "query embedding",
            deadline,
            || self.embedder.embed_query(query),
            ProviderError::is_quota_exhausted,
        )?;

        let hits = index.search(&embedding, self.options.k)?;
        let candidates = filter_hits(&hits, &self.options);

        log::debug!(
            "'{query}': {} hits, {} candidates after dedup/filter",
            hits.len(),
            candidates.len()
        );

        Ok(candidates)
    }
}

/// Dedup by chunk text (first wins), drop hits past the threshold when the
/// filter is on, then dedup the product names. Input order is preserved.
pub fn filter_hits(hits: &[SearchHit<'_>], options: &RetrieverOptions) -> Vec<Candidate> {
    let mut seen_texts = HashSet::new();
    let mut seen_names = HashSet::new();

    hits.iter()
        .filter(|hit| seen_texts.insert(hit.chunk.text.as_str()))
        .filter(|hit| !options.enable_score_filter || hit.distance <= options.score_threshold)
        .filter(|hit| seen_names.insert(hit.chunk.product_name.as_str()))
        .map(|hit| Candidate {
            product_name: hit.chunk.product_name.clone(),
            distance: hit.distance,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::index::IndexChunk;

    fn chunk(name: &str, text: &str) -> IndexChunk {
        IndexChunk {
            product_name: name.to_string(),
            text: text.to_string(),
            embedding: vec![1.0],
        }
    }

    fn options(filter: bool) -> RetrieverOptions {
        RetrieverOptions {
            k: 300,
            enable_score_filter: filter,
            score_threshold: 0.91,
        }
    }

    #[test]
    fn test_duplicate_texts_keep_first_occurrence() {
        let a = chunk("Papel Toalha 200m", "Papel Toalha 200m");
        let a_again = chunk("Papel Toalha 200m", "Papel Toalha 200m");
        let b = chunk("Detergente 5L", "Detergente 5L");
        let hits = [
            SearchHit { chunk: &a, distance: 0.1 },
            SearchHit { chunk: &a_again, distance: 0.1 },
            SearchHit { chunk: &b, distance: 0.5 },
        ];

        let candidates = filter_hits(&hits, &options(false));
        assert_eq!(
            candidates,
            vec![
                Candidate { product_name: "Papel Toalha 200m".into(), distance: 0.1 },
                Candidate { product_name: "Detergente 5L".into(), distance: 0.5 },
            ]
        );
    }

    #[test]
    fn test_chunks_of_same_product_collapse() {
        let first = chunk("Long product", "Long product part one");
        let second = chunk("Long product", "product part two");
        let other = chunk("Other", "Other");
        let hits = [
            SearchHit { chunk: &first, distance: 0.2 },
            SearchHit { chunk: &other, distance: 0.3 },
            SearchHit { chunk: &second, distance: 0.4 },
        ];

        let names: Vec<_> = filter_hits(&hits, &options(false))
            .into_iter()
            .map(|c| c.product_name)
            .collect();
        assert_eq!(names, vec!["Long product", "Other"]);
    }

    #[test]
    fn test_threshold_applies_only_when_enabled() {
        let near = chunk("near", "near");
        let far = chunk("far", "far");
        let hits = [
            SearchHit { chunk: &near, distance: 0.91 },
            SearchHit { chunk: &far, distance: 0.95 },
        ];

        assert_eq!(filter_hits(&hits, &options(false)).len(), 2);

        let filtered = filter_hits(&hits, &options(true));
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].product_name, "near");
    }

    #[test]
    fn test_candidate_serializes_camel_case() {
        let candidate = Candidate {
            product_name: "Detergente 5L".into(),
            distance: 0.5,
        };
        assert_eq!(
            serde_json::to_value(&candidate).unwrap(),
            serde_json::json!({"productName": "Detergente 5L", "distance": 0.5})
        );
    }
}
