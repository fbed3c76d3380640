//! Lifecycle of the process-wide product vector index.
//!
//! [`VectorIndexHandle`] owns the on-disk store and the loaded index and
//! moves through `Uninitialized -> Initializing -> Ready`, with
//! `Invalidating` while the store is being removed. Only one caller loads
//! or builds at a time; the others wait on a condvar for the outcome. The
//! state lock is never held while loading, embedding or backing off.
//!
//! Searches work on an `Arc` snapshot of the ready index, so invalidating
//! never pulls the index out from under a running query.

use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

use crate::catalog::{CatalogError, CatalogSnapshot, CatalogStore};
use crate::config::Config;
use crate::provider::ProviderError;
use crate::retry::{RetryError, RetryPolicy};
use crate::semantic::chunking::TextSplitter;
use crate::semantic::embeddings::Embedder;
use crate::semantic::index::{IndexChunk, IndexError, VectorIndex};
use crate::semantic::storage::{VectorStorage, VectorStorageError};

#[derive(Debug, thiserror::Error)]
pub enum IndexLifecycleError {
    #[error("catalog {0} has no products, refresh the catalog before building the index")]
    EmptyCatalog(PathBuf),

    #[error("Catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("vector store is still unreadable after a rebuild ({0}), run `prodmatch reindex`")]
    Incompatible(#[source] VectorStorageError),

    #[error("Index error: {0}")]
    Index(#[from] IndexError),

    #[error("Embedding failed: {0}")]
    Embedding(#[from] RetryError<ProviderError>),

    #[error("embedding service returned {got} vectors for {expected} texts")]
    EmbeddingCountMismatch { expected: usize, got: usize },
}

impl IndexLifecycleError {
    pub fn retry_error(&self) -> Option<&RetryError<ProviderError>> {
        match self {
            IndexLifecycleError::Embedding(err) => Some(err),
            _ => None,
        }
    }
}

/// Something that can throw away the persisted index after the catalog changed.
pub trait InvalidateIndex: Send + Sync {
    fn invalidate_index(&self) -> Result<(), VectorStorageError>;
}

impl InvalidateIndex for VectorStorage {
    fn invalidate_index(&self) -> Result<(), VectorStorageError> {
        self.delete()
    }
}

impl InvalidateIndex for VectorIndexHandle {
    fn invalidate_index(&self) -> Result<(), VectorStorageError> {
        self.invalidate()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct IndexOptions {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Texts per embedding request
    pub batch_size: usize,
    /// Rebuild when the catalog file changes under a ready index
    pub watch_catalog: bool,
}

impl IndexOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            chunk_size: config.index.chunk_size,
            chunk_overlap: config.index.chunk_overlap,
            batch_size: config.embedding.batch_size,
            watch_catalog: config.index.watch_catalog,
        }
    }
}

enum State {
    Uninitialized,
    Initializing,
    Ready(Arc<VectorIndex>),
    Invalidating,
}

struct Lifecycle {
    state: State,
    /// Catalog mtime observed when the ready index was produced
    catalog_stamp: Option<SystemTime>,
    /// Automatic rebuilds after an unreadable store since the last invalidate
    self_heals: u32,
}

pub struct VectorIndexHandle {
    catalog: CatalogStore,
    storage: VectorStorage,
    embedder: Arc<dyn Embedder>,
    retry: RetryPolicy,
    splitter: TextSplitter,
    options: IndexOptions,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

/// Resets an abandoned `Initializing` state if the loader panics.
struct InitGuard<'a> {
    handle: &'a VectorIndexHandle,
    armed: bool,
}

impl Drop for InitGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut lifecycle = self.handle.lock();
            lifecycle.state = State::Uninitialized;
            self.handle.changed.notify_all();
        }
    }
}

impl VectorIndexHandle {
    pub fn new(
        catalog: CatalogStore,
        storage: VectorStorage,
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
        options: IndexOptions,
    ) -> Self {
        Self {
            catalog,
            storage,
            embedder,
            retry,
            splitter: TextSplitter::new(options.chunk_size, options.chunk_overlap),
            options,
            lifecycle: Mutex::new(Lifecycle {
                state: State::Uninitialized,
                catalog_stamp: None,
                self_heals: 0,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn storage(&self) -> &VectorStorage {
        &self.storage
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.lock().state, State::Ready(_))
    }

    /// Return the ready index, loading the persisted store or building it
    /// from the catalog first if needed.
    pub fn ensure_ready(&self) -> Result<Arc<VectorIndex>, IndexLifecycleError> {
        // stat outside the lock; only a differing stamp is checked again under it
        let observed = self.options.watch_catalog.then(|| self.catalog.modified());
        let mut lifecycle = self.lock();

        loop {
            match &lifecycle.state {
                State::Ready(index) => {
                    let unchanged = match observed {
                        None => true,
                        Some(seen) => {
                            seen == lifecycle.catalog_stamp
                                || !self.catalog_changed(lifecycle.catalog_stamp)
                        }
                    };
                    if unchanged {
                        return Ok(index.clone());
                    }
                    log::info!("catalog {} changed, reloading index", self.catalog.path().display());
                    break;
                }
                State::Initializing | State::Invalidating => {
                    lifecycle = self.changed.wait(lifecycle).unwrap_or_else(PoisonError::into_inner);
                }
                State::Uninitialized => break,
            }
        }

        lifecycle.state = State::Initializing;
        let mut self_heals = lifecycle.self_heals;
        drop(lifecycle);

        let mut guard = InitGuard {
            handle: self,
            armed: true,
        };
        let result = self.load_or_build(&mut self_heals);
        guard.armed = false;

        let mut lifecycle = self.lock();
        lifecycle.self_heals = self_heals;
        let result = match result {
            Ok((index, stamp)) => {
                let index = Arc::new(index);
                lifecycle.state = State::Ready(index.clone());
                lifecycle.catalog_stamp = stamp;
                Ok(index)
            }
            Err(err) => {
                log::error!("vector index unavailable: {err}");
                lifecycle.state = State::Uninitialized;
                Err(err)
            }
        };
        self.changed.notify_all();

        result
    }

    /// Make sure an index exists, building it if needed. Returns the chunk count.
    ///
    /// A no-op once the index is ready, until [`invalidate`](Self::invalidate).
    pub fn build(&self) -> Result<usize, IndexLifecycleError> {
        self.ensure_ready().map(|index| index.len())
    }

    /// Delete the persisted store and drop the loaded index; the next
    /// [`ensure_ready`](Self::ensure_ready) rebuilds from the catalog.
    pub fn invalidate(&self) -> Result<(), VectorStorageError> {
        let mut lifecycle = self.wait_idle();
        lifecycle.state = State::Invalidating;
        drop(lifecycle);

        let result = self.storage.delete();

        let mut lifecycle = self.lock();
        lifecycle.state = State::Uninitialized;
        lifecycle.catalog_stamp = None;
        lifecycle.self_heals = 0;
        self.changed.notify_all();
        drop(lifecycle);

        match &result {
            Ok(()) => log::info!("vector index invalidated"),
            Err(err) => log::error!("failed to delete vector store: {err}"),
        }

        result
    }

    /// Drop the loaded index only; the next `ensure_ready` reloads the
    /// persisted store, picking up a rebuild done by another process.
    pub fn reload(&self) {
        let mut lifecycle = self.wait_idle();
        lifecycle.state = State::Uninitialized;
        lifecycle.catalog_stamp = None;
        self.changed.notify_all();
        log::info!("vector index unloaded, next query reloads it");
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self) -> MutexGuard<'_, Lifecycle> {
        let mut lifecycle = self.lock();
        while matches!(lifecycle.state, State::Initializing | State::Invalidating) {
            lifecycle = self.changed.wait(lifecycle).unwrap_or_else(PoisonError::into_inner);
        }
        lifecycle
    }

    fn catalog_changed(&self, stamp: Option<SystemTime>) -> bool {
        self.options.watch_catalog && self.catalog.modified() != stamp
    }

    fn load_or_build(
        &self,
        self_heals: &mut u32,
    ) -> Result<(VectorIndex, Option<SystemTime>), IndexLifecycleError> {
        // stamp before reading so a concurrent refresh is noticed next time
        let stamp = self.catalog.modified();
        let snapshot = self.catalog.load()?;
        if snapshot.is_empty() {
            return Err(IndexLifecycleError::EmptyCatalog(self.catalog.path().to_path_buf()));
        }

        let fingerprint = snapshot.fingerprint();
        let model_id = self.embedder.model_id_hash();

        match self
            .storage
            .load(&model_id, &fingerprint, self.embedder.dimensions())
        {
            Ok(index) => {
                log::info!(
                    "loaded vector index with {} chunks from {}",
                    index.len(),
                    self.storage.dir().display()
                );
                return Ok((index, stamp));
            }
            Err(err) if err.is_missing() => {
                log::info!("no vector index at {}, building", self.storage.dir().display());
            }
            Err(err) if err.is_stale() => {
                log::info!("vector index is out of date with the catalog, rebuilding");
                self.storage.delete()?;
            }
            Err(err) if err.is_incompatible() => {
                if *self_heals > 0 {
                    return Err(IndexLifecycleError::Incompatible(err));
                }
                log::warn!("vector index unreadable ({err}), deleting and rebuilding");
                *self_heals += 1;
                self.storage.delete()?;
            }
            Err(err) => return Err(err.into()),
        }

        let index = self.build_from(&snapshot, &model_id, &fingerprint)?;
        Ok((index, stamp))
    }

    fn build_from(
        &self,
        snapshot: &CatalogSnapshot,
        model_id: &[u8; 32],
        fingerprint: &[u8; 32],
    ) -> Result<VectorIndex, IndexLifecycleError> {
        let pieces: Vec<(&str, String)> = snapshot
            .products
            .iter()
            .flat_map(|product| {
                self.splitter
                    .split(&product.name)
                    .into_iter()
                    .map(move |text| (product.name.as_str(), text))
            })
            .collect();

        if pieces.is_empty() {
            return Err(IndexLifecycleError::EmptyCatalog(self.catalog.path().to_path_buf()));
        }

        log::info!(
            "embedding {} chunks from {} products",
            pieces.len(),
            snapshot.len()
        );

        let texts: Vec<String> = pieces.iter().map(|(_, text)| text.clone()).collect();
        let mut embeddings = Vec::with_capacity(texts.len());

        for (n, batch) in texts.chunks(self.options.batch_size.max(1)).enumerate() {
            let vectors = self.retry.run(
                &format!("embedding batch {}", n + 1),
                None,
                || self.embedder.embed_documents(batch),
                ProviderError::is_quota_exhausted,
            )?;

            if vectors.len() != batch.len() {
                return Err(IndexLifecycleError::EmbeddingCountMismatch {
                    expected: batch.len(),
                    got: vectors.len(),
                });
            }
            embeddings.extend(vectors);
        }

        let dimensions = self
            .embedder
            .dimensions()
            .or_else(|| embeddings.first().map(Vec::len))
            .unwrap_or_default();

        let mut index = VectorIndex::with_capacity(dimensions, pieces.len());
        for ((product_name, text), embedding) in pieces.into_iter().zip(embeddings) {
            let chunk = IndexChunk {
                product_name: product_name.to_string(),
                text,
                embedding,
            };
            match index.insert(chunk) {
                Ok(()) => {}
                Err(IndexError::ZeroNormVector) => {
                    log::warn!("skipping chunk of '{product_name}' with a zero embedding");
                }
                Err(err) => return Err(err.into()),
            }
        }

        self.storage.save(&index, model_id, fingerprint)?;
        log::info!(
            "vector index built with {} chunks at {}",
            index.len(),
            self.storage.dir().display()
        );

        Ok(index)
    }
}
