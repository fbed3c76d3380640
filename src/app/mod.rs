//! Query surface over the retrieval and rerank pipeline.

pub mod errors;
pub mod factory;
mod progress;

use std::sync::mpsc::Sender;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

pub use errors::AppError;
pub use factory::AppFactory;
pub use progress::ProgressEvent;

use crate::rerank::{RerankResult, Reranker};
use crate::semantic::{Candidate, Retriever, VectorIndexHandle};
use progress::Progress;

/// Result of one item of a bulk query.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ItemOutcome {
    Found(RerankResult),
    Failed { error: String },
}

pub struct App {
    index: Arc<VectorIndexHandle>,
    retriever: Retriever,
    reranker: Reranker,
    /// Budget of a single query, index build excluded
    query_timeout: Duration,
}

impl App {
    pub fn new(retriever: Retriever, reranker: Reranker, query_timeout: Duration) -> Self {
        Self {
            index: retriever.index().clone(),
            retriever,
            reranker,
            query_timeout,
        }
    }

    pub fn index(&self) -> &Arc<VectorIndexHandle> {
        &self.index
    }

    /// Best catalog matches for `target`. No relevant product gives an
    /// empty `matches` list, not an error.
    pub fn find_similar(&self, target: &str) -> Result<RerankResult, AppError> {
        self.find_similar_with_progress(target, None)
    }

    /// [`find_similar`](Self::find_similar), reporting each stage to `sink`.
    pub fn find_similar_with_progress(
        &self,
        target: &str,
        sink: Option<&Sender<ProgressEvent>>,
    ) -> Result<RerankResult, AppError> {
        let progress = Progress(sink);
        let result = self.run_query(target, progress);

        match &result {
            Ok(found) => progress.emit(ProgressEvent::Finished {
                result: found.clone(),
            }),
            Err(err) => progress.emit(ProgressEvent::Failed {
                reason: err.to_string(),
            }),
        }

        result
    }

    /// One outcome per target, in input order; failures stay per item.
    pub fn find_similar_bulk(&self, targets: &[String]) -> Vec<ItemOutcome> {
        targets
            .iter()
            .map(|target| match self.find_similar(target) {
                Ok(result) => ItemOutcome::Found(result),
                Err(err) => {
                    log::warn!("bulk query '{target}' failed: {err}");
                    ItemOutcome::Failed {
                        error: err.to_string(),
                    }
                }
            })
            .collect()
    }

    /// Retriever candidates only, without reranking.
    pub fn search(&self, query: &str) -> Result<Vec<Candidate>, AppError> {
        let deadline = Instant::now() + self.query_timeout;
        Ok(self.retriever.search(query, Some(deadline))?)
    }

    /// Delete the index and build it again. Returns the chunk count.
    pub fn reindex(&self) -> Result<usize, AppError> {
        self.index.invalidate()?;
        Ok(self.index.build()?)
    }

    pub fn invalidate_index(&self) -> Result<(), AppError> {
        Ok(self.index.invalidate()?)
    }

    pub fn reload_index(&self) {
        self.index.reload();
    }

    fn run_query(&self, target: &str, progress: Progress<'_>) -> Result<RerankResult, AppError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(AppError::EmptyTarget);
        }

        let deadline = Instant::now() + self.query_timeout;
        progress.emit(ProgressEvent::Started {
            target: target.to_string(),
        });

        let index = self.index.ensure_ready()?;
        progress.emit(ProgressEvent::IndexReady {
            chunks: index.len(),
        });

        let candidates = self.retriever.search_in(&index, target, Some(deadline))?;
        progress.emit(ProgressEvent::Candidates {
            count: candidates.len(),
        });

        if Instant::now() >= deadline {
            return Err(AppError::DeadlineExceeded(self.query_timeout));
        }

        let names: Vec<String> = candidates.into_iter().map(|c| c.product_name).collect();
        progress.emit(ProgressEvent::Reranking {
            candidates: names.len(),
        });

        let result = self.reranker.rerank(target, &names, Some(deadline))?;
        log::info!("'{target}': {} matches", result.matches.len());

        Ok(result)
    }
}
