use std::time::Duration;

use crate::config::ConfigError;
use crate::provider::ProviderError;
use crate::rerank::RerankError;
use crate::retry::RetryError;
use crate::semantic::{IndexLifecycleError, RetrievalError, VectorStorageError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("No target product provided.")]
    EmptyTarget,

    #[error(transparent)]
    Index(#[from] IndexLifecycleError),

    #[error("vector store error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error(transparent)]
    Retrieval(#[from] RetrievalError),

    #[error(transparent)]
    Rerank(#[from] RerankError),

    #[error("query did not finish within {0:?}")]
    DeadlineExceeded(Duration),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AppError {
    fn retry_error(&self) -> Option<&RetryError<ProviderError>> {
        match self {
            AppError::Index(err) => err.retry_error(),
            AppError::Retrieval(err) => err.retry_error(),
            AppError::Rerank(RerankError::Provider(err)) => Some(err),
            _ => None,
        }
    }

    /// An upstream service stayed rate limited through every retry.
    pub fn is_retry_exhausted(&self) -> bool {
        self.retry_error().is_some_and(RetryError::is_exhausted)
    }

    pub fn is_deadline(&self) -> bool {
        matches!(self, AppError::DeadlineExceeded(_))
            || self.retry_error().is_some_and(RetryError::is_deadline)
    }

    pub fn is_malformed_output(&self) -> bool {
        matches!(self, AppError::Rerank(err) if err.is_malformed())
    }
}
