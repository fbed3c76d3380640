//! Vector search over the product catalog.
//!
//! # Architecture
//!
//! - `embeddings`: embedding service contract and providers
//! - `chunking`: overlapping text splitter for product names
//! - `index`: in-memory vector index with cosine distance search
//! - `storage`: binary persistence of the index (`vectors.bin`)
//! - `service`: index lifecycle (load, build, invalidate)
//! - `retriever`: query -> deduplicated, filtered candidates

mod chunking;
pub mod embeddings;
mod index;
mod retriever;
mod service;
mod storage;

pub use embeddings::{create_embedder, Embedder};
pub use retriever::{Candidate, RetrievalError, Retriever, RetrieverOptions};
pub use service::{IndexLifecycleError, IndexOptions, InvalidateIndex, VectorIndexHandle};
pub use storage::{VectorStorage, VectorStorageError};
