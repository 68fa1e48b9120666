//! Embedding inference for vector search.
//!
//! Defines the [`Embedder`] trait and its implementations:
//! - **[`DisabledEmbedder`]**: every call fails; used when no provider is configured.
//! - **[`HttpEmbedder`]**: calls a remote inference API.
//!
//! Use [`create_embedder`] to pick one from [`EmbeddingConfig`].
//!
//! # Inference API
//!
//! | Call | Endpoint | Body |
//! |------|----------|------|
//! | text | `POST {url}/text` | `{ "model", "text" }` |
//! | CLIP text | `POST {url}/clip-text` | `{ "model", "text" }` |
//! | CLIP image | `POST {url}/clip-image` | `{ "model", "image" }` or `{ "model", "imageData" }` |
//!
//! The response carries the vector as `embedding` or `data[0].embedding`.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: base, 2×base, 4×base, ... (capped at 2^5 × base)

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::EmbeddingConfig;
use crate::error::{Error, Result};
use crate::fetch::{FetchCache, FetchOptions};

/// An image to embed into CLIP space.
#[derive(Debug, Clone, PartialEq)]
pub enum ImageInput {
    /// Publicly reachable image URL, fetched by the inference service.
    Url(String),
    /// Raw image bytes, sent base64-encoded.
    Bytes(Vec<u8>),
}

/// Turns queries into vectors.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Returns the model identifier.
    fn model_name(&self) -> &str;
    async fn embed_text(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_clip_text(&self, text: &str) -> Result<Vec<f32>>;
    async fn embed_clip_image(&self, image: &ImageInput) -> Result<Vec<f32>>;
}

/// Embedder used when no provider is configured.
pub struct DisabledEmbedder;

impl DisabledEmbedder {
    fn error() -> Error {
        Error::Embedding("embedding provider is disabled".to_string())
    }
}

#[async_trait]
impl Embedder for DisabledEmbedder {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn embed_text(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Self::error())
    }

    async fn embed_clip_text(&self, _text: &str) -> Result<Vec<f32>> {
        Err(Self::error())
    }

    async fn embed_clip_image(&self, _image: &ImageInput) -> Result<Vec<f32>> {
        Err(Self::error())
    }
}

/// Embedder backed by a remote inference API.
///
/// Requests go through the client's [`FetchCache`] as POSTs, so they share
/// its transport but are never cached or de-duplicated.
pub struct HttpEmbedder {
    fetch: Arc<FetchCache>,
    base_url: String,
    model: String,
    clip_model: String,
    max_retries: u32,
    backoff: Duration,
}

impl HttpEmbedder {
    pub fn new(config: &EmbeddingConfig, fetch: Arc<FetchCache>) -> Result<Self> {
        let base_url = config
            .url
            .as_deref()
            .map(|u| u.trim_end_matches('/').to_string())
            .filter(|u| !u.is_empty())
            .ok_or_else(|| Error::Validation("embedding.url required for http provider".into()))?;
        let model = config.model.clone().unwrap_or_else(|| "default".to_string());
        let clip_model = config.clip_model.clone().unwrap_or_else(|| model.clone());

        Ok(Self {
            fetch,
            base_url,
            model,
            clip_model,
            max_retries: config.max_retries,
            backoff: Duration::from_secs(1),
        })
    }

    /// Base delay before the first retry.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    async fn infer(&self, endpoint: &str, body: Value) -> Result<Vec<f32>> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let options = FetchOptions::post(body);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.backoff * (1u32 << (attempt - 1).min(5));
                debug!(url = %url, attempt, ?delay, "retrying embedding request");
                tokio::time::sleep(delay).await;
            }

            match self.fetch.fetch_json(&url, &options).await {
                Ok(response) => return parse_embedding(&response),
                Err(e) if e.is_transient() => {
                    warn!(url = %url, attempt, error = %e, "embedding request failed");
                    last_err = Some(e);
                }
                Err(e) => return Err(Error::Embedding(e.to_string())),
            }
        }

        Err(Error::Embedding(match last_err {
            Some(e) => format!("failed after {} retries: {}", self.max_retries, e),
            None => "failed after retries".to_string(),
        }))
    }
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        self.infer("text", json!({ "model": self.model, "text": text }))
            .await
    }

    async fn embed_clip_text(&self, text: &str) -> Result<Vec<f32>> {
        self.infer("clip-text", json!({ "model": self.clip_model, "text": text }))
            .await
    }

    async fn embed_clip_image(&self, image: &ImageInput) -> Result<Vec<f32>> {
        let body = match image {
            ImageInput::Url(url) => json!({ "model": self.clip_model, "image": url }),
            ImageInput::Bytes(bytes) => {
                json!({ "model": self.clip_model, "imageData": BASE64.encode(bytes) })
            }
        };
        self.infer("clip-image", body).await
    }
}

/// Extract the vector from `embedding` or `data[0].embedding`.
fn parse_embedding(response: &Value) -> Result<Vec<f32>> {
    let raw = response
        .get("embedding")
        .or_else(|| response.pointer("/data/0/embedding"))
        .and_then(Value::as_array)
        .ok_or_else(|| Error::Embedding("response is missing an embedding".to_string()))?;

    let vector: Vec<f32> = raw
        .iter()
        .map(|v| v.as_f64().map(|f| f as f32))
        .collect::<Option<_>>()
        .ok_or_else(|| Error::Embedding("embedding contains non-numeric values".to_string()))?;

    if vector.is_empty() {
        return Err(Error::Embedding("embedding is empty".to_string()));
    }
    Ok(vector)
}

/// Create an embedder from configuration.
///
/// # Errors
///
/// Returns [`Error::Validation`] for unknown providers or an `http`
/// provider without a URL.
pub fn create_embedder(
    config: &EmbeddingConfig,
    fetch: Arc<FetchCache>,
) -> Result<Arc<dyn Embedder>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledEmbedder)),
        "http" => Ok(Arc::new(HttpEmbedder::new(config, fetch)?)),
        other => Err(Error::Validation(format!(
            "unknown embedding provider: {}",
            other
        ))),
    }
}
