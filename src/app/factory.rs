use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use homedir::my_home;

use crate::app::App;
use crate::catalog::CatalogStore;
use crate::config::{Config, ConfigError};
use crate::credentials;
use crate::refresh::{Refresher, SqlHttpSource};
use crate::rerank::{create_chat, ChatModel, Reranker};
use crate::retry::RetryPolicy;
use crate::semantic::{
    create_embedder, Embedder, IndexOptions, Retriever, RetrieverOptions, VectorIndexHandle,
    VectorStorage,
};

/// Application factory wiring config, providers and the index handle together
pub struct AppFactory;

impl AppFactory {
    /// `$PRODMATCH_BASE_PATH`, else `~/.local/share/prodmatch`
    pub fn get_base_path() -> Result<PathBuf> {
        let base_path = match std::env::var("PRODMATCH_BASE_PATH") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => {
                let home = my_home()
                    .context("Could not determine home directory")?
                    .context("Home directory path is empty")?;
                home.join(".local/share/prodmatch")
            }
        };

        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("Failed to create base directory {}", base_path.display()))?;

        Ok(base_path)
    }

    pub fn load_config() -> Result<Config> {
        let base_path = Self::get_base_path()?;
        Config::load_with(&base_path)
            .with_context(|| format!("Failed to load config from {}", base_path.display()))
    }

    /// App backed by the configured remote (or local) providers.
    pub fn create_app(config: &Config) -> Result<App, ConfigError> {
        let embedder = create_embedder(&config.embedding, config.base_path())?;
        let chat = create_chat(&config.llm, config.base_path())?;
        let retry = RetryPolicy::from_config(&config.retry);

        Ok(Self::build_app(config, embedder, chat, retry))
    }

    /// Wire an app from already constructed providers.
    pub fn build_app(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        chat: Arc<dyn ChatModel>,
        retry: RetryPolicy,
    ) -> App {
        let index = Self::create_index_handle(config, embedder.clone(), retry.clone());

        let retriever = Retriever::new(
            index,
            embedder,
            retry.clone(),
            RetrieverOptions::from_config(&config.search),
        );
        let reranker = Reranker::new(chat, retry, config.search.max_rerank_candidates);

        App::new(
            retriever,
            reranker,
            Duration::from_secs(config.search.query_timeout_secs),
        )
    }

    pub fn create_index_handle(
        config: &Config,
        embedder: Arc<dyn Embedder>,
        retry: RetryPolicy,
    ) -> Arc<VectorIndexHandle> {
        Arc::new(VectorIndexHandle::new(
            CatalogStore::new(config.catalog_path()),
            VectorStorage::new(config.index_dir()),
            embedder,
            retry,
            IndexOptions::from_config(config),
        ))
    }

    /// Refresh job reading from the configured SQL-over-HTTP service.
    pub fn create_refresher(config: &Config) -> Result<Refresher, ConfigError> {
        let token = credentials::require(config.base_path(), credentials::WS_TOKEN)?;
        let source = SqlHttpSource::new(&config.catalog, token)?;

        Ok(Refresher::new(
            Box::new(source),
            CatalogStore::new(config.catalog_path()),
            config.base_path().to_path_buf(),
        ))
    }
}
