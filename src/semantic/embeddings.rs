//! Embedding client adapter.
//!
//! Wraps an external embedding provider with:
//! - batching (order preserving, one vector per input)
//! - input truncation to the provider's limit
//! - a distinct "unavailable" state when no provider credential is configured
//!
//! Retries for transient provider failures live in the provider itself
//! (see `OpenAiEmbedder`), so callers only ever see a final outcome.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::random;
use reqwest::blocking::Client;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::semantic::preprocess::truncate_for_embedding;

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    /// No provider configured (e.g. missing API key). Degraded mode, not a crash.
    #[error("embedding provider unavailable: {0}")]
    Unavailable(String),

    /// Transient or remote failure after retries were exhausted.
    #[error("embedding provider error: {0}")]
    Provider(String),

    #[error("invalid embedding response: {0}")]
    InvalidResponse(String),
}

/// A source of embedding vectors.
///
/// Implementations must return exactly one vector per input, in input order.
pub trait EmbeddingProvider: Send + Sync {
    /// Name of the model; records embedded by different models never mix.
    fn model_name(&self) -> &str;

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Adapter used by the rest of the crate.
#[derive(Clone)]
pub struct EmbeddingClient {
    provider: Option<Arc<dyn EmbeddingProvider>>,
    unavailable_reason: String,
    batch_size: usize,
    max_input_chars: usize,
}

impl EmbeddingClient {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, batch_size: usize, max_input_chars: usize) -> Self {
        Self {
            provider: Some(provider),
            unavailable_reason: String::new(),
            batch_size: batch_size.max(1),
            max_input_chars: max_input_chars.max(1),
        }
    }

    /// A client with no provider behind it; every call fails with `Unavailable`.
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            provider: None,
            unavailable_reason: reason.into(),
            batch_size: 1,
            max_input_chars: 1,
        }
    }

    pub fn is_available(&self) -> bool {
        self.provider.is_some()
    }

    /// Why embeddings cannot be produced, if they cannot.
    pub fn unavailable_reason(&self) -> Option<&str> {
        match self.provider {
            Some(_) => None,
            None => Some(&self.unavailable_reason),
        }
    }

    pub fn model_name(&self) -> Option<&str> {
        self.provider.as_ref().map(|p| p.model_name())
    }

    /// Embed a single text.
    pub fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let provider = self.provider()?;
        let input = truncate_for_embedding(text, self.max_input_chars);

        let mut vectors = provider.embed_batch(&[input.as_ref()])?;
        if vectors.len() != 1 {
            return Err(EmbeddingError::InvalidResponse(format!(
                "expected 1 embedding, got {}",
                vectors.len()
            )));
        }
        Ok(vectors.remove(0))
    }

    /// Embed many texts, sending at most `batch_size` per provider call.
    ///
    /// Output order matches input order. Fails as a whole if any batch fails.
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let provider = self.provider()?;
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut out = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let inputs: Vec<_> = batch
                .iter()
                .map(|text| truncate_for_embedding(text, self.max_input_chars))
                .collect();
            let refs: Vec<&str> = inputs.iter().map(|s| s.as_ref()).collect();

            let vectors = provider.embed_batch(&refs)?;
            if vectors.len() != batch.len() {
                return Err(EmbeddingError::InvalidResponse(format!(
                    "provider returned {} embeddings for {} inputs",
                    vectors.len(),
                    batch.len()
                )));
            }
            out.extend(vectors);
        }

        Ok(out)
    }

    fn provider(&self) -> Result<&Arc<dyn EmbeddingProvider>, EmbeddingError> {
        self.provider
            .as_ref()
            .ok_or_else(|| EmbeddingError::Unavailable(self.unavailable_reason.clone()))
    }
}

/// Blocking embeddings client for OpenAI-compatible endpoints.
pub struct OpenAiEmbedder {
    client: Client,
    endpoint: String,
    model: String,
    dimensions: Option<usize>,
    max_retries: usize,
}

impl OpenAiEmbedder {
    /// Builds a new OpenAI embeddings client.
    ///
    /// Must be called outside of an async runtime (blocking reqwest client).
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: &str,
        dimensions: Option<usize>,
        timeout: Duration,
        max_retries: usize,
    ) -> Result<Self, EmbeddingError> {
        if api_key.trim().is_empty() {
            return Err(EmbeddingError::Unavailable("missing OpenAI API key".to_string()));
        }

        let mut headers = reqwest::header::HeaderMap::new();
        let auth = format!("Bearer {}", api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth)
                .map_err(|_| EmbeddingError::Unavailable("invalid OpenAI API key".to_string()))?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(|e| EmbeddingError::Provider(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            model: model.to_string(),
            dimensions,
            max_retries,
        })
    }

    fn should_retry(status: StatusCode) -> bool {
        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
    }

    fn is_retryable_error(err: &reqwest::Error) -> bool {
        err.is_timeout() || err.is_connect() || err.is_body() || err.is_request()
    }

    fn retry_backoff(attempt: usize) -> Duration {
        let capped = attempt.min(5) as u32;
        Duration::from_millis(500 * (1 << capped) + random::<u64>() % 250)
    }
}

impl EmbeddingProvider for OpenAiEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.dimensions,
        };

        let mut attempt = 0usize;
        loop {
            match self.client.post(&self.endpoint).json(&request).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let parsed: EmbeddingResponse = resp.json().map_err(|e| {
                            EmbeddingError::InvalidResponse(format!("failed to parse response: {e}"))
                        })?;
                        return parsed.into_vectors(texts.len());
                    }

                    let body = resp
                        .text()
                        .unwrap_or_else(|_| "<body unavailable>".to_string());
                    if Self::should_retry(status) && attempt < self.max_retries {
                        attempt += 1;
                        log::warn!(
                            "embedding request failed ({status}), retrying (attempt {attempt}/{})",
                            self.max_retries
                        );
                        thread::sleep(Self::retry_backoff(attempt));
                        continue;
                    }
                    return Err(EmbeddingError::Provider(format!(
                        "embeddings request failed ({status}): {body}"
                    )));
                }
                Err(err) => {
                    if Self::is_retryable_error(&err) && attempt < self.max_retries {
                        attempt += 1;
                        log::warn!(
                            "embedding request error: {err}, retrying (attempt {attempt}/{})",
                            self.max_retries
                        );
                        thread::sleep(Self::retry_backoff(attempt));
                        continue;
                    }
                    return Err(EmbeddingError::Provider(err.to_string()));
                }
            }
        }
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

impl EmbeddingResponse {
    /// Restore input order and check the count.
    fn into_vectors(mut self, expected: usize) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.data.sort_by_key(|entry| entry.index);
        if self.data.len() != expected {
            return Err(EmbeddingError::InvalidResponse(format!(
                "returned {} embeddings for {} inputs",
                self.data.len(),
                expected
            )));
        }
        Ok(self.data.into_iter().map(|entry| entry.embedding).collect())
    }
}
