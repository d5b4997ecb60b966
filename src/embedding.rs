//! Embedding generation via a hosted, OpenAI-compatible inference API.

use crate::config::EmbeddingConfig;
use crate::error::{Error, InferenceError, Result};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Anything that can turn a query into a vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
}

/// Output of a batch embedding call.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingBatch {
    pub embeddings: Vec<Vec<f32>>,
    pub model: String,
    pub dimensions: usize,
    pub total_tokens: u64,
}

/// How a failed attempt should be handled.
#[derive(Debug)]
enum AttemptError {
    RateLimited(String),
    Transient(String),
    Fatal(String),
}

/// HTTP client for the embedding API with batching and retries.
#[derive(Clone)]
pub struct EmbeddingClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    config: EmbeddingConfig,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|error| anyhow::anyhow!("failed to build embedding HTTP client: {error}"))?;
        let endpoint = format!("{}/embeddings", config.base_url.trim_end_matches('/'));
        Ok(Self {
            http,
            endpoint,
            api_key: config.api_key.clone(),
            config,
        })
    }

    /// Embed many texts, splitting them into API-sized batches.
    pub async fn embed_batch(&self, texts: &[String]) -> Result<EmbeddingBatch> {
        let mut embeddings = Vec::with_capacity(texts.len());
        let mut total_tokens = 0;
        let mut model = self.config.model.clone();

        let cleaned: Vec<String> = texts
            .iter()
            .map(|text| clean_text(text, self.config.max_text_chars))
            .collect();

        for chunk in cleaned.chunks(self.config.batch_size.max(1)) {
            let response = self.request_with_retry(chunk).await?;
            total_tokens += response.usage.map(|usage| usage.total_tokens).unwrap_or(0);
            if let Some(returned_model) = response.model {
                model = returned_model;
            }

            let mut data = response.data;
            data.sort_by_key(|entry| entry.index);
            if data.len() != chunk.len() {
                return Err(InferenceError::Fatal(format!(
                    "API returned {} embeddings for {} inputs",
                    data.len(),
                    chunk.len()
                ))
                .into());
            }
            embeddings.extend(data.into_iter().map(|entry| entry.embedding));
        }

        let dimensions = embeddings.first().map(Vec::len).unwrap_or(0);
        if embeddings.iter().any(|embedding| embedding.len() != dimensions) {
            return Err(InferenceError::Fatal("API returned ragged embeddings".into()).into());
        }
        if dimensions != 0 && dimensions != self.config.dimensions {
            return Err(InferenceError::Fatal(format!(
                "expected {}-dimensional embeddings, got {}",
                self.config.dimensions, dimensions
            ))
            .into());
        }

        tracing::debug!(
            count = embeddings.len(),
            dimensions,
            total_tokens,
            "embedded batch"
        );

        Ok(EmbeddingBatch {
            embeddings,
            model,
            dimensions,
            total_tokens,
        })
    }

    async fn request_with_retry(&self, inputs: &[String]) -> Result<EmbeddingResponse> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let error = match self.request_once(inputs).await {
                Ok(response) => return Ok(response),
                Err(error) => error,
            };

            let (delay, message) = match error {
                AttemptError::Fatal(message) => {
                    return Err(InferenceError::Fatal(message).into());
                }
                AttemptError::RateLimited(message) => {
                    let exponent = (attempt - 1).min(10);
                    let delay = Duration::from_millis(
                        self.config.rate_limit_backoff_ms.saturating_mul(1 << exponent),
                    );
                    (delay, message)
                }
                AttemptError::Transient(message) => (
                    Duration::from_millis(self.config.transient_retry_delay_ms),
                    message,
                ),
            };

            if attempt >= max_attempts {
                return Err(InferenceError::Transient {
                    attempts: attempt,
                    last_error: message,
                }
                .into());
            }

            tracing::warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %message,
                "embedding request failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn request_once(
        &self,
        inputs: &[String],
    ) -> std::result::Result<EmbeddingResponse, AttemptError> {
        let body = EmbeddingRequest {
            model: &self.config.model,
            input: inputs,
        };
        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(api_key) = &self.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|error| {
            if error.is_timeout() || error.is_connect() || error.is_request() || error.is_body() {
                AttemptError::Transient(error.to_string())
            } else {
                AttemptError::Fatal(error.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<EmbeddingResponse>()
                .await
                .map_err(|error| AttemptError::Fatal(format!("malformed response: {error}")));
        }

        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "<body unavailable>".to_string());
        let message = format!("embedding API returned {status}: {body}");
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => AttemptError::RateLimited(message),
            status if status.is_server_error() => AttemptError::Transient(message),
            _ => AttemptError::Fatal(message),
        })
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let batch = self.embed_batch(&[text.to_string()]).await?;
        batch
            .embeddings
            .into_iter()
            .next()
            .ok_or_else(|| Error::from(InferenceError::Fatal("empty embedding response".into())))
    }
}

/// Collapse runs of whitespace and truncate to `max_chars` characters.
pub fn clean_text(text: &str, max_chars: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.char_indices().nth(max_chars) {
        Some((byte_index, _)) => collapsed[..byte_index].to_string(),
        None => collapsed,
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    #[serde(default)]
    total_tokens: u64,
}
