//! Transport plumbing shared by the embedding and chat providers.
//!
//! Rate-limit and quota responses are surfaced as
//! [`ProviderError::QuotaExhausted`], the only kind the retry wrapper
//! treats as retryable.

use std::time::Duration;

use reqwest::blocking::{Client, Response};

/// Longest response body kept in error messages
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{service} quota exhausted (status {status}): {body}")]
    QuotaExhausted {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} returned status {status}: {body}")]
    Http {
        service: &'static str,
        status: u16,
        body: String,
    },

    #[error("{service} request failed: {source}")]
    Transport {
        service: &'static str,
        source: reqwest::Error,
    },

    #[error("{service} sent an unexpected response: {message}")]
    InvalidResponse {
        service: &'static str,
        message: String,
    },

    #[error("{0}")]
    Backend(String),
}

impl ProviderError {
    pub fn is_quota_exhausted(&self) -> bool {
        matches!(self, ProviderError::QuotaExhausted { .. })
    }

    pub fn invalid(service: &'static str, message: impl Into<String>) -> Self {
        ProviderError::InvalidResponse {
            service,
            message: message.into(),
        }
    }
}

pub fn http_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|source| ProviderError::Transport {
            service: "http client",
            source,
        })
}

/// Pass successful responses through, classify the rest.
pub fn check_response(service: &'static str, response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().unwrap_or_default();
    Err(classify_failure(service, status.as_u16(), body))
}

pub fn classify_failure(service: &'static str, status: u16, body: String) -> ProviderError {
    let body = truncate(body);
    if status == 429 || looks_like_quota(&body) {
        ProviderError::QuotaExhausted {
            service,
            status,
            body,
        }
    } else {
        ProviderError::Http {
            service,
            status,
            body,
        }
    }
}

pub fn transport(service: &'static str) -> impl Fn(reqwest::Error) -> ProviderError {
    move |source| ProviderError::Transport { service, source }
}

fn looks_like_quota(body: &str) -> bool {
    let body = body.to_lowercase();
    body.contains("resource_exhausted")
        || body.contains("insufficient_quota")
        || body.contains("quota exceeded")
        || body.contains("rate limit")
}

fn truncate(mut body: String) -> String {
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
        body.push_str("...");
    }
    body
}
