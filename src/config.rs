use std::path::{Path, PathBuf};

use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_EMBEDDING_MODEL: &str = "models/embedding-001";
const DEFAULT_EMBEDDING_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
const DEFAULT_LLM_MODEL: &str = "gpt-4o-mini";
const DEFAULT_LLM_API_BASE: &str = "https://api.openai.com/v1";

/// Default number of nearest chunks fetched per query before dedup
const DEFAULT_SEARCH_K: usize = 300;
/// Default cosine-distance cutoff used when the score filter is enabled
const DEFAULT_SCORE_THRESHOLD: f32 = 0.91;

const DEFAULT_CATALOG_URL: &str = "http://192.168.1.23:9060/consultaSQL";
const DEFAULT_CATALOG_QUERY: &str = r#"SELECT "ItemName" FROM "SBO_COPAPEL_PRD"."OITM" WHERE "validFor" = 'Y' AND "ItemType" = 'I' ORDER BY "ItemCode";"#;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("config is malformed: {0}")]
    Malformed(#[from] serde_yml::Error),

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("missing credential {0}: set it in the environment or in the .env file of the data directory")]
    MissingCredential(&'static str),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    /// Google Generative Language `batchEmbedContents`
    Gemini,
    /// Any OpenAI compatible `/embeddings` endpoint
    OpenAi,
    /// fastembed running in-process
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub api_base: String,
    pub timeout_secs: u64,
    /// Texts sent per embedding request while building the index
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Gemini,
            model: DEFAULT_EMBEDDING_MODEL.to_string(),
            api_base: DEFAULT_EMBEDDING_API_BASE.to_string(),
            timeout_secs: 60,
            batch_size: 100,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub api_base: String,
    pub temperature: f32,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_LLM_MODEL.to_string(),
            api_base: DEFAULT_LLM_API_BASE.to_string(),
            temperature: 0.0,
            timeout_secs: 120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Directory (relative to the base path) holding the persisted index
    pub dir: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Rebuild when the catalog file changes under a loaded index
    pub watch_catalog: bool,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dir: "vector_db_products".to_string(),
            chunk_size: 1000,
            chunk_overlap: 200,
            watch_catalog: true,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_search_k")]
    pub k: usize,

    /// Drop hits whose cosine distance is above `score_threshold`
    #[serde(default)]
    pub enable_score_filter: bool,

    #[serde(default = "default_score_threshold")]
    pub score_threshold: f32,

    /// Upper bound of candidates handed to the reranker
    #[serde(default = "default_search_k")]
    pub max_rerank_candidates: usize,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_SEARCH_K,
            enable_score_filter: false,
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            max_rerank_candidates: DEFAULT_SEARCH_K,
            query_timeout_secs: default_query_timeout_secs(),
        }
    }
}

fn default_search_k() -> usize {
    DEFAULT_SEARCH_K
}

fn default_score_threshold() -> f32 {
    DEFAULT_SCORE_THRESHOLD
}

/// Covers the full default retry schedule (about 900s of backoff) plus a
/// rerank call.
fn default_query_timeout_secs() -> u64 {
    1800
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay_secs: u64,
    pub max_delay_secs: u64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_secs: 60,
            max_delay_secs: 600,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Longest total sleep before the last attempt, jitter included.
    pub fn max_total_backoff_secs(&self) -> u64 {
        let jitter = u64::from(self.jitter);
        (1..self.max_attempts)
            .map(|retry| {
                let factor = 2u64.saturating_pow(retry - 1);
                self.initial_delay_secs
                    .saturating_mul(factor)
                    .saturating_add(jitter)
                    .min(self.max_delay_secs)
            })
            .fold(0, u64::saturating_add)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    /// Catalog file name inside the base path
    pub file: String,
    pub source_url: String,
    pub query: String,
    pub timeout_secs: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            file: "products.json".to_string(),
            source_url: DEFAULT_CATALOG_URL.to_string(),
            query: DEFAULT_CATALOG_QUERY.to_string(),
            timeout_secs: 120,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    /// Local wall clock time (HH:MM) of the daily catalog refresh
    pub daily_at: String,
    pub run_on_start: bool,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            daily_at: "00:00".to_string(),
            run_on_start: true,
        }
    }
}

impl RefreshConfig {
    pub fn daily_at_time(&self) -> Result<NaiveTime, ConfigError> {
        NaiveTime::parse_from_str(&self.daily_at, "%H:%M").map_err(|_| {
            ConfigError::Invalid(format!(
                "refresh.daily_at must be HH:MM, got '{}'",
                self.daily_at
            ))
        })
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:1313".to_string(),
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub refresh: RefreshConfig,
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let index = &self.index;
        if index.chunk_size == 0 {
            return invalid("index.chunk_size must be greater than 0".to_string());
        }
        if index.chunk_overlap >= index.chunk_size {
            return invalid(format!(
                "index.chunk_overlap ({}) must be smaller than index.chunk_size ({})",
                index.chunk_overlap, index.chunk_size
            ));
        }
        if index.dir.trim().is_empty() {
            return invalid("index.dir must not be empty".to_string());
        }

        let emb = &self.embedding;
        if !(1..=1000).contains(&emb.batch_size) {
            return invalid(format!(
                "embedding.batch_size must be between 1 and 1000, got {}",
                emb.batch_size
            ));
        }
        if emb.provider != EmbeddingProviderKind::Local {
            check_url("embedding.api_base", &emb.api_base)?;
        }

        let search = &self.search;
        if search.k == 0 {
            return invalid("search.k must be greater than 0".to_string());
        }
        if search.max_rerank_candidates == 0 {
            return invalid("search.max_rerank_candidates must be greater than 0".to_string());
        }
        if !search.score_threshold.is_finite() || search.score_threshold < 0.0 {
            return invalid(format!(
                "search.score_threshold must be a non-negative number, got {}",
                search.score_threshold
            ));
        }
        if search.query_timeout_secs == 0 {
            return invalid("search.query_timeout_secs must be greater than 0".to_string());
        }

        let retry = &self.retry;
        if retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1".to_string());
        }
        if retry.initial_delay_secs > retry.max_delay_secs {
            return invalid(format!(
                "retry.initial_delay_secs ({}) must not exceed retry.max_delay_secs ({})",
                retry.initial_delay_secs, retry.max_delay_secs
            ));
        }

        // a deadline shorter than the backoff schedule turns every
        // persistent rate limit into a timeout before the last attempt
        let needed = retry
            .max_total_backoff_secs()
            .saturating_add(self.llm.timeout_secs);
        if search.query_timeout_secs <= needed {
            return invalid(format!(
                "search.query_timeout_secs ({}) must exceed the retry backoff plus llm.timeout_secs ({needed})",
                search.query_timeout_secs
            ));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return invalid(format!(
                "llm.temperature must be between 0.0 and 2.0, got {}",
                self.llm.temperature
            ));
        }
        check_url("llm.api_base", &self.llm.api_base)?;

        if self.catalog.file.trim().is_empty() {
            return invalid("catalog.file must not be empty".to_string());
        }
        check_url("catalog.source_url", &self.catalog.source_url)?;

        self.refresh.daily_at_time()?;

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults when absent.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        std::fs::create_dir_all(base_path).map_err(|source| ConfigError::Io {
            path: base_path.to_path_buf(),
            source,
        })?;

        let config_path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !config_path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            write_file(&config_path, defaults.as_bytes())?;
        }

        let config_str = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Io {
            path: config_path.clone(),
            source,
        })?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case new keys were filled with defaults
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let config_str = serde_yml::to_string(&self)?;
        write_file(&self.base_path.join(CONFIG_FILE), config_str.as_bytes())
    }

    /// In-memory config rooted at `base_path`, used by tests and tooling.
    pub fn with_base_path(mut self, base_path: &Path) -> Self {
        self.base_path = base_path.to_path_buf();
        self
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn catalog_path(&self) -> PathBuf {
        self.base_path.join(&self.catalog.file)
    }

    pub fn index_dir(&self) -> PathBuf {
        self.base_path.join(&self.index.dir)
    }
}

fn check_url(field: &str, value: &str) -> Result<(), ConfigError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|err| ConfigError::Invalid(format!("{field} is not a valid url ({err}): '{value}'")))
}

fn write_file(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let temp_path = path.with_extension("yaml.tmp");
    std::fs::write(&temp_path, data)
        .and_then(|_| std::fs::rename(&temp_path, path))
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
}
