//! Embedding service contract and its providers.
//!
//! - [`GeminiEmbedder`]: Google Generative Language `batchEmbedContents`
//! - [`OpenAiEmbedder`]: any OpenAI compatible `/embeddings` endpoint
//! - `LocalEmbedder`: fastembed in-process (feature `local-embeddings`)
//!
//! Remote providers report rate limiting as
//! [`ProviderError::QuotaExhausted`] and never retry on their own.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::config::{ConfigError, EmbeddingConfig, EmbeddingProviderKind};
use crate::credentials;
use crate::provider::{self, ProviderError};

pub trait Embedder: Send + Sync {
    /// Provider tag, part of the stored model identity
    fn provider(&self) -> &'static str;

    fn model_name(&self) -> &str;

    /// Output size when known before the first call.
    fn dimensions(&self) -> Option<usize> {
        None
    }

    /// Embed catalog chunks, in input order.
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError>;

    /// SHA256 of `provider:model`, stored in the index header.
    fn model_id_hash(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.provider().as_bytes());
        hasher.update(b":");
        hasher.update(self.model_name().as_bytes());
        hasher.finalize().into()
    }
}

pub fn create_embedder(
    config: &EmbeddingConfig,
    base_path: &Path,
) -> Result<Arc<dyn Embedder>, ConfigError> {
    let timeout = Duration::from_secs(config.timeout_secs);

    let embedder: Arc<dyn Embedder> = match config.provider {
        EmbeddingProviderKind::Gemini => {
            let api_key = credentials::require(base_path, credentials::GOOGLE_API_KEY)?;
            Arc::new(GeminiEmbedder::new(&config.api_base, &config.model, api_key, timeout)?)
        }
        EmbeddingProviderKind::OpenAi => {
            let api_key = credentials::require(base_path, credentials::OPENAI_API_KEY)?;
            Arc::new(OpenAiEmbedder::new(&config.api_base, &config.model, api_key, timeout)?)
        }
        #[cfg(feature = "local-embeddings")]
        EmbeddingProviderKind::Local => Arc::new(
            local::LocalEmbedder::new(&config.model, base_path)
                .map_err(|err| ConfigError::Invalid(err.to_string()))?,
        ),
        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingProviderKind::Local => {
            return Err(ConfigError::Invalid(
                "embedding.provider 'local' requires the local-embeddings feature".to_string(),
            ))
        }
    };

    log::info!(
        "embedding provider: {} ({})",
        embedder.provider(),
        embedder.model_name()
    );

    Ok(embedder)
}

fn build_client(timeout: Duration) -> Result<Client, ConfigError> {
    provider::http_client(timeout).map_err(|err| ConfigError::Invalid(err.to_string()))
}

const GEMINI: &str = "gemini embeddings";

pub struct GeminiEmbedder {
    client: Client,
    api_base: String,
    /// Always `models/<name>`
    model: String,
    api_key: String,
}

impl GeminiEmbedder {
    pub fn new(
        api_base: &str,
        model: &str,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let model = if model.starts_with("models/") {
            model.to_string()
        } else {
            format!("models/{model}")
        };

        Ok(Self {
            client: build_client(timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }

    fn batch_embed(&self, texts: &[String], task_type: &str) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let requests: Vec<Value> = texts
            .iter()
            .map(|text| {
                json!({
                    "model": self.model,
                    "content": { "parts": [{ "text": text }] },
                    "taskType": task_type,
                })
            })
            .collect();

        let response = self
            .client
            .post(format!("{}/{}:batchEmbedContents", self.api_base, self.model))
            .header("x-goog-api-key", &self.api_key)
            .json(&json!({ "requests": requests }))
            .send()
            .map_err(provider::transport(GEMINI))?;

        let body: Value = provider::check_response(GEMINI, response)?
            .json()
            .map_err(provider::transport(GEMINI))?;

        let embeddings = parse_gemini_response(&body)?;
        if embeddings.len() != texts.len() {
            return Err(ProviderError::invalid(
                GEMINI,
                format!("asked for {} embeddings, got {}", texts.len(), embeddings.len()),
            ));
        }

        Ok(embeddings)
    }
}

impl Embedder for GeminiEmbedder {
    fn provider(&self) -> &'static str {
        "gemini"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.batch_embed(texts, "RETRIEVAL_DOCUMENT")
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.batch_embed(&[text.to_string()], "RETRIEVAL_QUERY")?
            .pop()
            .ok_or_else(|| ProviderError::invalid(GEMINI, "no embedding returned"))
    }
}

/// `{"embeddings": [{"values": [..]}, ..]}`
fn parse_gemini_response(body: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let embeddings = body
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::invalid(GEMINI, "missing embeddings array"))?;

    embeddings
        .iter()
        .map(|item| {
            item.get("values")
                .and_then(Value::as_array)
                .ok_or_else(|| ProviderError::invalid(GEMINI, "missing embedding values"))
                .and_then(|values| to_vector(GEMINI, values))
        })
        .collect()
}

const OPENAI: &str = "openai embeddings";

pub struct OpenAiEmbedder {
    client: Client,
    api_base: String,
    model: String,
    api_key: String,
}

impl OpenAiEmbedder {
    pub fn new(
        api_base: &str,
        model: &str,
        api_key: String,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            client: build_client(timeout)?,
            api_base: api_base.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        })
    }
}

impl Embedder for OpenAiEmbedder {
    fn provider(&self) -> &'static str {
        "openai"
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&json!({ "model": self.model, "input": texts }))
            .send()
            .map_err(provider::transport(OPENAI))?;

        let body: Value = provider::check_response(OPENAI, response)?
            .json()
            .map_err(provider::transport(OPENAI))?;

        let embeddings = parse_openai_response(&body)?;
        if embeddings.len() != texts.len() {
            return Err(ProviderError::invalid(
                OPENAI,
                format!("asked for {} embeddings, got {}", texts.len(), embeddings.len()),
            ));
        }

        Ok(embeddings)
    }

    fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
        self.embed_documents(&[text.to_string()])?
            .pop()
            .ok_or_else(|| ProviderError::invalid(OPENAI, "no embedding returned"))
    }
}

/// `{"data": [{"index": 0, "embedding": [..]}, ..]}`, sorted back into input order.
fn parse_openai_response(body: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = body
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| ProviderError::invalid(OPENAI, "missing data array"))?;

    let mut indexed = data
        .iter()
        .enumerate()
        .map(|(position, item)| -> Result<(u64, Vec<f32>), ProviderError> {
            let index = item
                .get("index")
                .and_then(Value::as_u64)
                .unwrap_or(position as u64);
            let values = item
                .get("embedding")
                .and_then(Value::as_array)
                .ok_or_else(|| ProviderError::invalid(OPENAI, "missing embedding"))?;
            Ok((index, to_vector(OPENAI, values)?))
        })
        .collect::<Result<Vec<_>, ProviderError>>()?;

    indexed.sort_by_key(|(index, _)| *index);

    Ok(indexed.into_iter().map(|(_, embedding)| embedding).collect())
}

fn to_vector(service: &'static str, values: &[Value]) -> Result<Vec<f32>, ProviderError> {
    values
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| ProviderError::invalid(service, "non-numeric embedding value"))
        })
        .collect()
}

#[cfg(feature = "local-embeddings")]
pub mod local {
    //! fastembed wrapper. Models are downloaded into `<base>/models` on first use.

    use std::path::Path;
    use std::sync::Mutex;

    use fastembed::{InitOptions, TextEmbedding};

    use super::Embedder;
    use crate::provider::ProviderError;

    #[derive(Debug, thiserror::Error)]
    pub enum LocalEmbeddingError {
        #[error("Model initialization failed: {0}")]
        InitFailed(String),

        #[error("Invalid model name: {0}")]
        InvalidModel(String),
    }

    /// Uses a Mutex because fastembed's embed() requires &mut self.
    pub struct LocalEmbedder {
        model: Mutex<TextEmbedding>,
        model_name: String,
        dimensions: usize,
        /// e5 models expect `query: ` / `passage: ` prefixes
        e5_prefixes: bool,
    }

    impl LocalEmbedder {
        pub fn new(model_name: &str, base_path: &Path) -> Result<Self, LocalEmbeddingError> {
            let model_enum = parse_model_name(model_name)?;

            let models_dir = base_path.join("models");
            std::fs::create_dir_all(&models_dir).map_err(|e| {
                LocalEmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
            })?;

            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);

            let mut model = TextEmbedding::try_new(options)
                .map_err(|e| LocalEmbeddingError::InitFailed(e.to_string()))?;

            let dimensions = model
                .embed(vec!["test"], None)
                .map_err(|e| LocalEmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?
                .first()
                .map(|v| v.len())
                .ok_or_else(|| LocalEmbeddingError::InitFailed("Model returned no embedding".to_string()))?;

            Ok(Self {
                model: Mutex::new(model),
                model_name: model_name.to_lowercase(),
                dimensions,
                e5_prefixes: model_name.to_lowercase().contains("e5"),
            })
        }

        fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>, ProviderError> {
            let mut model = self
                .model
                .lock()
                .map_err(|e| ProviderError::Backend(format!("Failed to acquire model lock: {}", e)))?;

            model
                .embed(texts, None)
                .map_err(|e| ProviderError::Backend(format!("Embedding generation failed: {}", e)))
        }
    }

    impl Embedder for LocalEmbedder {
        fn provider(&self) -> &'static str {
            "local"
        }

        fn model_name(&self) -> &str {
            &self.model_name
        }

        fn dimensions(&self) -> Option<usize> {
            Some(self.dimensions)
        }

        fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            if texts.is_empty() {
                return Ok(vec![]);
            }
            let texts = if self.e5_prefixes {
                texts.iter().map(|t| format!("passage: {t}")).collect()
            } else {
                texts.to_vec()
            };
            self.embed(texts)
        }

        fn embed_query(&self, text: &str) -> Result<Vec<f32>, ProviderError> {
            let text = if self.e5_prefixes {
                format!("query: {text}")
            } else {
                text.to_string()
            };
            self.embed(vec![text])?
                .pop()
                .ok_or_else(|| ProviderError::Backend("No embedding returned".to_string()))
        }
    }

    /// Parse model name string to fastembed enum.
    pub fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, LocalEmbeddingError> {
        match name.to_lowercase().as_str() {
            "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
            "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
            "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
            "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
            "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
            "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
            "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
            _ => Err(LocalEmbeddingError::InvalidModel(format!(
                "Unknown model: {}. Supported models: multilingual-e5-small, multilingual-e5-base, \
                 multilingual-e5-large, all-MiniLM-L6-v2, \
                 bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5",
                name
            ))),
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_gemini_response() {
        let body = json!({
            "embeddings": [
                { "values": [0.1, 0.2, 0.3] },
                { "values": [0.4, 0.5, 0.6] }
            ]
        });
        let embeddings = parse_gemini_response(&body).unwrap();
        assert_eq!(embeddings.len(), 2);
        assert!((embeddings[1][2] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_parse_gemini_rejects_missing_values() {
        let body = json!({ "embeddings": [{ "oops": [] }] });
        assert!(matches!(
            parse_gemini_response(&body),
            Err(ProviderError::InvalidResponse { .. })
        ));
    }

    #[test]
    fn test_parse_openai_response_sorts_by_index() {
        let body = json!({
            "data": [
                { "index": 1, "embedding": [0.0, 1.0] },
                { "index": 0, "embedding": [1.0, 0.0] }
            ]
        });
        let embeddings = parse_openai_response(&body).unwrap();
        assert_eq!(embeddings, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
    }

    #[test]
    fn test_parse_openai_rejects_non_numeric() {
        let body = json!({ "data": [{ "index": 0, "embedding": ["a"] }] });
        assert!(parse_openai_response(&body).is_err());
    }

    #[test]
    fn test_gemini_model_gets_models_prefix() {
        let embedder =
            GeminiEmbedder::new("https://example.test/v1beta/", "embedding-001", "k".into(), Duration::from_secs(1))
                .unwrap();
        assert_eq!(embedder.model_name(), "models/embedding-001");
        assert_eq!(embedder.api_base, "https://example.test/v1beta");
    }

    #[test]
    fn test_model_id_depends_on_provider() {
        let gemini =
            GeminiEmbedder::new("https://a.test", "models/x", "k".into(), Duration::from_secs(1)).unwrap();
        let openai =
            OpenAiEmbedder::new("https://a.test", "models/x", "k".into(), Duration::from_secs(1)).unwrap();
        assert_ne!(gemini.model_id_hash(), openai.model_id_hash());
    }
}
