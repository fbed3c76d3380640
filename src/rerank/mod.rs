//! LLM reranking of retrieved candidates into a validated [`RerankResult`].
//!
//! Quota failures of the chat call go through the retry policy. Answers
//! that do not parse or break the result schema fail immediately: the same
//! prompt would most likely produce the same answer again.

mod chat;
mod prompt;
mod result;

use std::sync::Arc;
use std::time::Instant;

pub use chat::{create_chat, ChatModel};
pub use result::RerankResult;
#[cfg(test)]
pub use prompt::{PRODUCT_LIST_CLOSE, PRODUCT_LIST_OPEN, TARGET_CLOSE, TARGET_OPEN};
#[cfg(test)]
pub use result::{RerankMatch, MAX_MATCHES};

use prompt::build_prompt;

use crate::provider::ProviderError;
use crate::retry::{RetryError, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum RerankError {
    #[error("rerank call failed: {0}")]
    Provider(#[from] RetryError<ProviderError>),

    #[error("model answer is not valid JSON: {reason}")]
    MalformedOutput { reason: String, raw: String },

    #[error("model answer breaks the result schema: {reason}")]
    SchemaViolation { reason: String, raw: String },
}

impl RerankError {
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            RerankError::MalformedOutput { .. } | RerankError::SchemaViolation { .. }
        )
    }

    pub fn raw_output(&self) -> Option<&str> {
        match self {
            RerankError::MalformedOutput { raw, .. } | RerankError::SchemaViolation { raw, .. } => {
                Some(raw)
            }
            RerankError::Provider(_) => None,
        }
    }
}

pub struct Reranker {
    chat: Arc<dyn ChatModel>,
    retry: RetryPolicy,
    /// Candidates beyond this are not shown to the model
    max_candidates: usize,
}

impl Reranker {
    pub fn new(chat: Arc<dyn ChatModel>, retry: RetryPolicy, max_candidates: usize) -> Self {
        Self {
            chat,
            retry,
            max_candidates: max_candidates.max(1),
        }
    }

    /// Pick up to [`MAX_MATCHES`](result::MAX_MATCHES) best candidates for `target`.
    ///
    /// No candidates means no match; the model is not called.
    pub fn rerank(
        &self,
        target: &str,
        candidates: &[String],
        deadline: Option<Instant>,
    ) -> Result<RerankResult, RerankError> {
        if candidates.is_empty() {
            return Ok(RerankResult::empty(target));
        }

        let shown = &candidates[..candidates.len().min(self.max_candidates)];
        let prompt = build_prompt(target, shown);

        let raw = self.retry.run(
            "rerank",
            deadline,
            || self.chat.complete(&prompt),
            ProviderError::is_quota_exhausted,
        )?;

        let result = parse_answer(target, &raw)?;
        log::debug!(
            "'{target}': {} of {} candidates kept by {}",
            result.matches.len(),
            shown.len(),
            self.chat.model_name()
        );

        Ok(result)
    }
}

/// Parse and validate a model answer for `target`.
///
/// Tolerates a markdown code fence around the JSON. A bare `null`/`None`
/// answer is the empty result.
pub fn parse_answer(target: &str, raw: &str) -> Result<RerankResult, RerankError> {
    let body = strip_code_fence(raw.trim());

    if body == "null" || body == "None" {
        return Ok(RerankResult::empty(target));
    }

    let mut result: RerankResult =
        serde_json::from_str(body).map_err(|err| RerankError::MalformedOutput {
            reason: err.to_string(),
            raw: raw.to_string(),
        })?;

    result
        .validate()
        .map_err(|reason| RerankError::SchemaViolation {
            reason,
            raw: raw.to_string(),
        })?;

    result.target_product = target.to_string();

    Ok(result)
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // drop an optional language tag on the opening line
    let rest = rest.split_once('\n').map_or("", |(_, body)| body);
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}
