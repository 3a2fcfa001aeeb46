// SPDX-License-Identifier: MIT OR Apache-2.0

//! Remote embeddings API client with micro-batching and retry.
//!
//! Every `embed` call enqueues its text on a bounded channel and waits on a
//! oneshot reply. A single background task drains the channel: it waits for
//! the first item, then keeps collecting until the batch is full or the
//! flush interval has elapsed, and sends the batch as one HTTP request.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use super::provider::{truncate_to_chars, Embedding, EmbeddingProvider, Venue};
use crate::config::{Config, EmbeddingProviderType};
use crate::errors::EmbedError;

pub const DEFAULT_GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/openai";
pub const DEFAULT_GEMINI_MODEL: &str = "gemini-embedding-001";
pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_OPENAI_MODEL: &str = "text-embedding-3-small";
pub const DEFAULT_REMOTE_DIMENSION: usize = 768;
const DEFAULT_VERTEX_LOCATION: &str = "us-central1";
const MAX_REMOTE_DIMENSION: usize = 3072;
const MAX_ERROR_TEXT: usize = 400;

/// Request/response shape spoken by the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    /// `POST {base}/embeddings` with `{model, input, dimensions}`
    OpenAi,
    /// `POST .../models/{model}:predict` with `{instances, parameters}`
    Vertex,
}

/// Resolved settings for a [`RemoteEmbedder`].
#[derive(Debug, Clone)]
pub struct RemoteConfig {
    /// Provider label used in logs, e.g. "gemini"
    pub provider: String,
    pub flavor: ApiFlavor,
    /// Full request URL
    pub endpoint: String,
    pub model: String,
    pub api_key: String,
    pub dimension: usize,
    pub batch_size: usize,
    pub batch_flush: Duration,
    pub max_retries: u32,
    pub request_timeout: Duration,
    pub max_chars: usize,
}

impl RemoteConfig {
    /// OpenAI-compatible settings with default batching.
    pub fn openai_compatible(base_url: &str, api_key: &str, model: &str, dimension: usize) -> Self {
        Self {
            provider: "openai-compatible".to_string(),
            flavor: ApiFlavor::OpenAi,
            endpoint: format!("{}/embeddings", normalize_base_url(base_url)),
            model: model.to_string(),
            api_key: api_key.to_string(),
            dimension,
            batch_size: 24,
            batch_flush: Duration::from_millis(12),
            max_retries: 3,
            request_timeout: Duration::from_secs(30),
            max_chars: 8000,
        }
    }

    /// Resolves endpoint, model, credentials and batching from configuration.
    pub fn from_config(config: &Config) -> Result<Self, EmbedError> {
        let embeddings = &config.embeddings;
        let provider = embeddings.provider();

        // A local model name left in the config does not apply to API providers.
        let configured_model = embeddings.model().filter(|m| !m.contains("nomic"));
        let dimension = embeddings
            .dimension
            .unwrap_or(DEFAULT_REMOTE_DIMENSION)
            .clamp(1, MAX_REMOTE_DIMENSION);

        let (label, flavor, endpoint, model) = match provider {
            EmbeddingProviderType::Openai => {
                let model = configured_model.unwrap_or(DEFAULT_OPENAI_MODEL).to_string();
                let base = embeddings
                    .base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_OPENAI_BASE_URL);
                ("openai", ApiFlavor::OpenAi, format!("{}/embeddings", normalize_base_url(base)), model)
            }
            EmbeddingProviderType::OpenaiCompatible => {
                let model = configured_model.unwrap_or(DEFAULT_OPENAI_MODEL).to_string();
                let base = embeddings
                    .base_url
                    .as_deref()
                    .filter(|b| !b.trim().is_empty())
                    .ok_or_else(|| {
                        EmbedError::Config(
                            "openai-compatible provider requires a base URL (CODESCOUT_EMBEDDING_BASE_URL)"
                                .to_string(),
                        )
                    })?;
                (
                    "openai-compatible",
                    ApiFlavor::OpenAi,
                    format!("{}/embeddings", normalize_base_url(base)),
                    model,
                )
            }
            EmbeddingProviderType::Gemini => {
                let model = configured_model.unwrap_or(DEFAULT_GEMINI_MODEL).to_string();
                let base = embeddings
                    .base_url
                    .as_deref()
                    .unwrap_or(DEFAULT_GEMINI_BASE_URL);
                ("gemini", ApiFlavor::OpenAi, format!("{}/embeddings", normalize_base_url(base)), model)
            }
            EmbeddingProviderType::Vertex => {
                let model = configured_model.unwrap_or(DEFAULT_GEMINI_MODEL).to_string();
                let project = embeddings
                    .vertex_project
                    .as_deref()
                    .filter(|p| !p.trim().is_empty())
                    .ok_or_else(|| {
                        EmbedError::Config("vertex provider requires embeddings.vertex_project".to_string())
                    })?;
                let location = embeddings
                    .vertex_location
                    .as_deref()
                    .filter(|l| !l.trim().is_empty())
                    .unwrap_or(DEFAULT_VERTEX_LOCATION);
                let base = match embeddings.base_url.as_deref() {
                    Some(base) if !base.trim().is_empty() => normalize_base_url(base),
                    _ => format!("https://{}-aiplatform.googleapis.com/v1", location),
                };
                let endpoint = format!(
                    "{}/projects/{}/locations/{}/publishers/google/models/{}:predict",
                    base, project, location, model
                );
                ("vertex", ApiFlavor::Vertex, endpoint, model)
            }
            other => {
                return Err(EmbedError::Config(format!(
                    "{:?} is not a remote embedding provider",
                    other
                )))
            }
        };

        let api_key = config.api_key().ok_or_else(|| {
            EmbedError::Config(format!(
                "Missing API key/token for embedding provider '{}'",
                label
            ))
        })?;

        Ok(Self {
            provider: label.to_string(),
            flavor,
            endpoint,
            model,
            api_key,
            dimension,
            batch_size: embeddings.batch_size(),
            batch_flush: Duration::from_millis(embeddings.batch_flush_ms()),
            max_retries: embeddings.max_retries(),
            request_timeout: Duration::from_millis(embeddings.request_timeout_ms()),
            max_chars: embeddings.max_chars(),
        })
    }

    /// Upper bound on how long one caller can wait for its vector.
    fn reply_timeout(&self) -> Duration {
        let attempts = self.max_retries + 1;
        let backoff: Duration = (1..=self.max_retries).map(retry_delay).sum();
        self.request_timeout * attempts + backoff + self.batch_flush + Duration::from_secs(1)
    }
}

/// Backoff before retry number `attempt` (1-based): `min(2000ms, 150ms * 2^(attempt-1))`.
pub fn retry_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    Duration::from_millis((150u64 << exp).min(2000))
}

fn normalize_base_url(base: &str) -> String {
    base.trim().trim_end_matches('/').to_string()
}

struct PendingEmbed {
    text: String,
    reply: oneshot::Sender<Result<Vec<f32>, EmbedError>>,
}

/// Embedding provider backed by a remote HTTP API.
pub struct RemoteEmbedder {
    sender: mpsc::Sender<PendingEmbed>,
    model: String,
    dimension: usize,
    max_chars: usize,
    reply_timeout: Duration,
}

impl RemoteEmbedder {
    /// Creates the embedder and spawns its flush task on the current runtime.
    pub fn new(config: RemoteConfig) -> Result<Self, EmbedError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| EmbedError::Config(format!("failed to build HTTP client: {}", err)))?;

        tracing::info!(
            "Remote embedder: provider={} model={} endpoint={} dim={} batch={} flush={}ms",
            config.provider,
            config.model,
            config.endpoint,
            config.dimension,
            config.batch_size,
            config.batch_flush.as_millis()
        );

        let (sender, receiver) = mpsc::channel(config.batch_size.max(1) * 8);
        let embedder = Self {
            sender,
            model: config.model.clone(),
            dimension: config.dimension,
            max_chars: config.max_chars,
            reply_timeout: config.reply_timeout(),
        };
        tokio::spawn(flush_loop(receiver, client, config));
        Ok(embedder)
    }
}

#[async_trait]
impl EmbeddingProvider for RemoteEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::InvalidInput);
        }

        let (reply, response) = oneshot::channel();
        let pending = PendingEmbed {
            text: truncate_to_chars(text, self.max_chars).into_owned(),
            reply,
        };
        self.sender
            .send(pending)
            .await
            .map_err(|_| EmbedError::Closed)?;

        match tokio::time::timeout(self.reply_timeout, response).await {
            Ok(Ok(result)) => result.map(Embedding::new),
            Ok(Err(_)) => Err(EmbedError::Closed),
            Err(_) => Err(EmbedError::Timeout),
        }
    }

    fn model_id(&self) -> String {
        self.model.clone()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn venue(&self) -> Venue {
        Venue::Api
    }
}

async fn flush_loop(
    mut receiver: mpsc::Receiver<PendingEmbed>,
    client: reqwest::Client,
    config: RemoteConfig,
) {
    let batch_size = config.batch_size.max(1);
    while let Some(first) = receiver.recv().await {
        let mut batch = vec![first];
        let deadline = Instant::now() + config.batch_flush;
        while batch.len() < batch_size {
            match tokio::time::timeout_at(deadline, receiver.recv()).await {
                Ok(Some(item)) => batch.push(item),
                Ok(None) | Err(_) => break,
            }
        }
        dispatch(&client, &config, batch).await;
    }
    tracing::debug!("Remote embedder flush task stopped ({})", config.provider);
}

async fn dispatch(client: &reqwest::Client, config: &RemoteConfig, batch: Vec<PendingEmbed>) {
    let texts: Vec<&str> = batch.iter().map(|item| item.text.as_str()).collect();
    tracing::debug!("Flushing {} embedding request(s) to {}", texts.len(), config.provider);

    let result = request_with_retry(client, config, &texts).await.and_then(|rows| {
        if rows.len() != batch.len() {
            Err(EmbedError::CountMismatch {
                expected: batch.len(),
                actual: rows.len(),
            })
        } else {
            Ok(rows)
        }
    });

    match result {
        Ok(rows) => {
            for (idx, (item, row)) in batch.into_iter().zip(rows).enumerate() {
                let outcome = row.filter(|v| !v.is_empty()).ok_or_else(|| {
                    EmbedError::InvalidResponse(format!("missing embedding vector at index {}", idx))
                });
                let _ = item.reply.send(outcome);
            }
        }
        Err(err) => {
            tracing::warn!("Embedding batch of {} failed: {}", batch.len(), err);
            for item in batch {
                let _ = item.reply.send(Err(err.clone()));
            }
        }
    }
}

async fn request_with_retry(
    client: &reqwest::Client,
    config: &RemoteConfig,
    texts: &[&str],
) -> Result<Vec<Option<Vec<f32>>>, EmbedError> {
    let body = request_body(config, texts);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match send_once(client, config, &body).await {
            Ok(rows) => return Ok(rows),
            Err(err) if err.is_retryable() && attempt <= config.max_retries => {
                let delay = retry_delay(attempt);
                tracing::debug!(
                    "Embedding request attempt {} failed ({}), retrying in {}ms",
                    attempt,
                    err,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

fn request_body(config: &RemoteConfig, texts: &[&str]) -> Value {
    match config.flavor {
        ApiFlavor::OpenAi => json!({
            "model": config.model,
            "input": texts,
            "dimensions": config.dimension,
        }),
        ApiFlavor::Vertex => json!({
            "instances": texts.iter().map(|t| json!({ "content": t })).collect::<Vec<_>>(),
            "parameters": { "outputDimensionality": config.dimension },
        }),
    }
}

async fn send_once(
    client: &reqwest::Client,
    config: &RemoteConfig,
    body: &Value,
) -> Result<Vec<Option<Vec<f32>>>, EmbedError> {
    let response = client
        .post(&config.endpoint)
        .bearer_auth(&config.api_key)
        .json(body)
        .send()
        .await?;

    let status = response.status();
    if status.is_success() {
        let payload: Value = response.json().await?;
        return parse_response(config.flavor, payload);
    }

    let text = clean_error_text(&response.text().await.unwrap_or_default());
    let message = if text.is_empty() {
        "no response body".to_string()
    } else {
        text
    };
    if status.as_u16() == 429 || status.is_server_error() {
        Err(EmbedError::TransientNetwork(format!("({}) {}", status.as_u16(), message)))
    } else {
        Err(EmbedError::NonRetryableRemote {
            status: status.as_u16(),
            message,
        })
    }
}

#[derive(Deserialize)]
struct OpenAiResponse {
    data: Vec<OpenAiRow>,
}

#[derive(Deserialize)]
struct OpenAiRow {
    #[serde(default)]
    embedding: Option<Vec<f32>>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Deserialize)]
struct VertexResponse {
    predictions: Vec<VertexPrediction>,
}

#[derive(Deserialize)]
struct VertexPrediction {
    #[serde(default)]
    embeddings: Option<VertexValues>,
}

#[derive(Deserialize)]
struct VertexValues {
    #[serde(default)]
    values: Option<Vec<f32>>,
}

fn parse_response(flavor: ApiFlavor, payload: Value) -> Result<Vec<Option<Vec<f32>>>, EmbedError> {
    match flavor {
        ApiFlavor::OpenAi => {
            let mut parsed: OpenAiResponse = serde_json::from_value(payload)
                .map_err(|err| EmbedError::InvalidResponse(err.to_string()))?;
            if parsed.data.iter().all(|row| row.index.is_some()) {
                parsed.data.sort_by_key(|row| row.index);
            }
            Ok(parsed.data.into_iter().map(|row| row.embedding).collect())
        }
        ApiFlavor::Vertex => {
            let parsed: VertexResponse = serde_json::from_value(payload)
                .map_err(|err| EmbedError::InvalidResponse(err.to_string()))?;
            Ok(parsed
                .predictions
                .into_iter()
                .map(|p| p.embeddings.and_then(|e| e.values))
                .collect())
        }
    }
}

fn clean_error_text(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_to_chars(&collapsed, MAX_ERROR_TEXT).into_owned()
}
