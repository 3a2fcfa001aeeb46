// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding provider interface and the provider factory.
//!
//! Two families implement [`EmbeddingProvider`]: in-process inference
//! ([`LocalEmbedder`]) and remote embedding APIs ([`RemoteEmbedder`]).
//! [`DummyProvider`] produces deterministic vectors for tests and offline use.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use super::local::{default_loader, LocalEmbedder, LocalOptions};
use super::remote::{RemoteConfig, RemoteEmbedder};
use crate::config::{Config, EmbeddingProviderType};
use crate::errors::EmbedError;

/// Default dimension of the dummy provider.
pub const DEFAULT_DUMMY_DIMENSION: usize = 384;

/// Where inference runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Venue {
    /// In-process on the host CPU
    Cpu,
    /// A remote embeddings API
    Api,
}

impl fmt::Display for Venue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Venue::Cpu => f.write_str("cpu"),
            Venue::Api => f.write_str("api"),
        }
    }
}

/// A single embedding vector.
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    pub vector: Vec<f32>,
}

impl Embedding {
    pub fn new(vector: Vec<f32>) -> Self {
        Self { vector }
    }

    /// Length of the vector.
    pub fn dimension(&self) -> usize {
        self.vector.len()
    }
}

/// Trait for embedding providers.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embeds one non-empty text.
    ///
    /// Blank or whitespace-only input fails with [`EmbedError::InvalidInput`].
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError>;

    /// Returns the model identifier currently serving requests.
    fn model_id(&self) -> String;

    /// Returns the advertised output dimension.
    ///
    /// May change once if a local provider degrades to its fallback model.
    fn dimension(&self) -> usize;

    /// Returns where inference runs.
    fn venue(&self) -> Venue;
}

/// Dummy provider that returns deterministic hash-seeded vectors (for testing/offline use).
pub struct DummyProvider {
    dimension: usize,
}

impl DummyProvider {
    /// Creates a new dummy provider with specified dimension.
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    /// The unit vector produced for `text`.
    fn vector_for(&self, text: &str) -> Vec<f32> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(text.as_bytes());
        let mut reader = hasher.finalize_xof();
        let mut bytes = vec![0u8; self.dimension * 4];
        reader.fill(&mut bytes);

        let mut vector: Vec<f32> = bytes
            .chunks_exact(4)
            .map(|b| {
                let raw = u32::from_le_bytes([b[0], b[1], b[2], b[3]]);
                (raw as f32 / u32::MAX as f32) * 2.0 - 1.0
            })
            .collect();
        l2_normalize(&mut vector);
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for DummyProvider {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::InvalidInput);
        }
        Ok(Embedding::new(self.vector_for(text)))
    }

    fn model_id(&self) -> String {
        "dummy".to_string()
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn venue(&self) -> Venue {
        Venue::Cpu
    }
}

/// Builds the provider selected by `[embeddings].provider`.
///
/// Local models are loaded (and, if needed, downloaded) before this returns.
pub async fn create_provider(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    let embeddings = &config.embeddings;
    match embeddings.provider() {
        EmbeddingProviderType::Dummy => Ok(Arc::new(DummyProvider::new(
            embeddings.dimension.unwrap_or(DEFAULT_DUMMY_DIMENSION),
        ))),
        EmbeddingProviderType::Local => {
            let options = LocalOptions::from_config(embeddings)?;
            let loader = default_loader(embeddings.model_cache_dir.clone())?;
            tracing::info!(
                "Loading local embedding model {} ({}d)",
                options.model.name(),
                options.dimension
            );
            let embedder = tokio::task::spawn_blocking(move || LocalEmbedder::load(loader, options))
                .await
                .context("Local model loader task failed")?
                .context("Failed to load local embedding model")?;
            Ok(Arc::new(embedder))
        }
        EmbeddingProviderType::Openai
        | EmbeddingProviderType::OpenaiCompatible
        | EmbeddingProviderType::Gemini
        | EmbeddingProviderType::Vertex => {
            let remote = RemoteConfig::from_config(config)?;
            Ok(Arc::new(RemoteEmbedder::new(remote)?))
        }
    }
}

pub(crate) fn truncate_to_chars(input: &str, max_chars: usize) -> Cow<'_, str> {
    if max_chars == 0 {
        return Cow::Borrowed("");
    }

    let mut count = 0;
    for (idx, _) in input.char_indices() {
        if count == max_chars {
            return Cow::Owned(input[..idx].to_string());
        }
        count += 1;
    }

    Cow::Borrowed(input)
}

pub(crate) fn l2_normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm == 0.0 {
        return;
    }
    for value in vector.iter_mut() {
        *value /= norm;
    }
}
