//! Chat completion contract used by the reranker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::{json, Value};

use crate::config::{ConfigError, LlmConfig};
use crate::credentials;
use crate::provider::{self, ProviderError};

pub trait ChatModel: Send + Sync {
    fn model_name(&self) -> &str;

    /// Send one user prompt, return the raw text of the answer.
    fn complete(&self, prompt: &str) -> Result<String, ProviderError>;
}

pub fn create_chat(config: &LlmConfig, base_path: &Path) -> Result<Arc<dyn ChatModel>, ConfigError> {
    let api_key = credentials::require(base_path, credentials::OPENAI_API_KEY)?;
    let chat = OpenAiChat::new(config, api_key)?;
    log::info!("rerank model: {}", chat.model_name());
    Ok(Arc::new(chat))
}

const SERVICE: &str = "chat completions";

/// OpenAI compatible `/chat/completions` client asking for a JSON object answer.
pub struct OpenAiChat {
    client: Client,
    api_base: String,
    model: String,
    api_key: String,
    temperature: f32,
}

impl OpenAiChat {
    pub fn new(config: &LlmConfig, api_key: String) -> Result<Self, ConfigError> {
        let client = provider::http_client(Duration::from_secs(config.timeout_secs))
            .map_err(|err| ConfigError::Invalid(err.to_string()))?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            temperature: config.temperature,
        })
    }

    fn request_body(&self, prompt: &str) -> Value {
        json!({
            "model": self.model,
            "temperature": self.temperature,
            "messages": [{ "role": "user", "content": prompt }],
            "response_format": { "type": "json_object" },
        })
    }
}

impl ChatModel for OpenAiChat {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn complete(&self, prompt: &str) -> Result<String, ProviderError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&self.request_body(prompt))
            .send()
            .map_err(provider::transport(SERVICE))?;

        let body: Value = provider::check_response(SERVICE, response)?
            .json()
            .map_err(provider::transport(SERVICE))?;

        parse_completion(&body)
    }
}

/// `choices[0].message.content`
fn parse_completion(body: &Value) -> Result<String, ProviderError> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProviderError::invalid(SERVICE, "missing choices[0].message.content"))
}
