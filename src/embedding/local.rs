// SPDX-License-Identifier: MIT OR Apache-2.0

//! In-process embedding with Matryoshka dimension truncation.
//!
//! The primary model is nomic-embed-text-v1.5, whose 768d output can be cut
//! to any of [`VALID_MRL_DIMENSIONS`]. Corrupted model artifacts trigger one
//! purge-and-reload; if that fails the embedder can degrade to MiniLM (384d)
//! for the rest of its life.

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::provider::{l2_normalize, truncate_to_chars, Embedding, EmbeddingProvider, Venue};
use crate::config::EmbeddingConfig;
use crate::errors::EmbedError;

/// Output dimensions supported by MRL truncation.
pub const VALID_MRL_DIMENSIONS: [usize; 5] = [64, 128, 256, 512, 768];

/// Dimension used when none, or an unsupported one, is configured.
pub const DEFAULT_MRL_DIMENSION: usize = 256;

const LAYER_NORM_EPS: f32 = 1e-5;

/// Models the local embedder knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalModel {
    /// nomic-embed-text-v1.5, 768d, MRL-capable
    NomicEmbedTextV15,
    /// all-MiniLM-L6-v2, 384d
    AllMiniLmL6V2,
}

impl LocalModel {
    pub fn name(self) -> &'static str {
        match self {
            LocalModel::NomicEmbedTextV15 => "nomic-ai/nomic-embed-text-v1.5",
            LocalModel::AllMiniLmL6V2 => "sentence-transformers/all-MiniLM-L6-v2",
        }
    }

    /// Substring identifying this model's files in a model cache directory.
    pub fn cache_fragment(self) -> &'static str {
        match self {
            LocalModel::NomicEmbedTextV15 => "nomic-embed-text-v1.5",
            LocalModel::AllMiniLmL6V2 => "all-MiniLM-L6-v2",
        }
    }

    pub fn native_dimension(self) -> usize {
        match self {
            LocalModel::NomicEmbedTextV15 => 768,
            LocalModel::AllMiniLmL6V2 => 384,
        }
    }

    pub fn supports_mrl(self) -> bool {
        matches!(self, LocalModel::NomicEmbedTextV15)
    }

    /// Resolves a configured model name. `None` selects the MRL model.
    pub fn from_name(name: Option<&str>) -> Result<Self, EmbedError> {
        let Some(raw) = name else {
            return Ok(LocalModel::NomicEmbedTextV15);
        };
        let value = raw.trim().to_lowercase();
        if value.contains("nomic") {
            return Ok(LocalModel::NomicEmbedTextV15);
        }
        match value.as_str() {
            "minilm"
            | "all-minilm-l6-v2"
            | "xenova/all-minilm-l6-v2"
            | "sentence-transformers/all-minilm-l6-v2" => Ok(LocalModel::AllMiniLmL6V2),
            _ => Err(EmbedError::Config(format!(
                "Unsupported local model '{}'. Supported: nomic-ai/nomic-embed-text-v1.5, minilm",
                raw
            ))),
        }
    }
}

/// A loaded model that produces raw (un-truncated) vectors.
pub trait InferenceModel: Send + Sync {
    fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError>;
}

/// Loads models and purges their cached artifacts.
pub trait ModelLoader: Send + Sync {
    fn load(&self, model: LocalModel) -> Result<Arc<dyn InferenceModel>, EmbedError>;

    /// Deletes cached artifacts for `model`. Returns whether anything was removed.
    fn purge(&self, model: LocalModel) -> Result<bool, EmbedError>;
}

/// Options for [`LocalEmbedder::load`].
#[derive(Debug, Clone)]
pub struct LocalOptions {
    pub model: LocalModel,
    /// Target output dimension; only meaningful for MRL models.
    pub dimension: usize,
    /// Degrade to MiniLM after an unrecoverable corruption.
    pub fallback: bool,
    pub max_chars: usize,
    pub timeout: Duration,
}

impl LocalOptions {
    pub fn from_config(config: &EmbeddingConfig) -> Result<Self, EmbedError> {
        let model = LocalModel::from_name(config.model())?;
        let dimension = if model.supports_mrl() {
            resolve_mrl_dimension(config.dimension)
        } else {
            model.native_dimension()
        };
        Ok(Self {
            model,
            dimension,
            fallback: config.fallback(),
            max_chars: config.max_chars(),
            timeout: Duration::from_millis(config.request_timeout_ms()),
        })
    }
}

impl Default for LocalOptions {
    fn default() -> Self {
        Self {
            model: LocalModel::NomicEmbedTextV15,
            dimension: DEFAULT_MRL_DIMENSION,
            fallback: true,
            max_chars: 8000,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Picks a supported MRL dimension, warning on anything else.
pub fn resolve_mrl_dimension(requested: Option<usize>) -> usize {
    match requested {
        None => DEFAULT_MRL_DIMENSION,
        Some(dim) if VALID_MRL_DIMENSIONS.contains(&dim) => dim,
        Some(dim) => {
            tracing::warn!(
                "Invalid MRL dimension {}, using {}. Valid: {:?}",
                dim,
                DEFAULT_MRL_DIMENSION,
                VALID_MRL_DIMENSIONS
            );
            DEFAULT_MRL_DIMENSION
        }
    }
}

/// Whether an error message indicates corrupted model artifacts.
pub fn is_corruption_error(message: &str) -> bool {
    message.contains("Protobuf parsing failed")
        || message.contains("Invalid model")
        || (message.contains("ONNX") && message.contains("corrupt"))
}

/// Layer-normalises `full`, keeps the first `dimension` values and L2-normalises them.
pub fn mrl_truncate(full: &[f32], dimension: usize) -> Vec<f32> {
    if full.is_empty() {
        return Vec::new();
    }
    let n = full.len() as f32;
    let mean = full.iter().sum::<f32>() / n;
    let variance = full.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
    let denom = (variance + LAYER_NORM_EPS).sqrt();

    let mut sliced: Vec<f32> = full
        .iter()
        .take(dimension)
        .map(|v| (v - mean) / denom)
        .collect();
    l2_normalize(&mut sliced);
    sliced
}

struct ActiveModel {
    kind: LocalModel,
    model: Arc<dyn InferenceModel>,
    dimension: usize,
}

impl ActiveModel {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let mut rows = self.model.embed(&[text.to_string()])?;
        let raw = rows
            .pop()
            .ok_or_else(|| EmbedError::Model("No embedding returned".to_string()))?;
        if self.kind.supports_mrl() {
            Ok(mrl_truncate(&raw, self.dimension))
        } else {
            let mut vector = raw;
            l2_normalize(&mut vector);
            Ok(vector)
        }
    }
}

struct LocalInner {
    loader: Arc<dyn ModelLoader>,
    active: RwLock<Arc<ActiveModel>>,
    recovery_lock: Mutex<()>,
    recovery_attempted: AtomicBool,
    fallback: bool,
    max_chars: usize,
}

/// In-process embedding provider.
pub struct LocalEmbedder {
    inner: Arc<LocalInner>,
    timeout: Duration,
}

impl LocalEmbedder {
    /// Loads the configured model, blocking the calling thread.
    ///
    /// A corruption error during loading purges the cache and retries once.
    /// If the model still cannot be loaded and fallback is enabled, MiniLM is
    /// loaded instead.
    pub fn load(loader: Arc<dyn ModelLoader>, options: LocalOptions) -> Result<Self, EmbedError> {
        let recovery_attempted = AtomicBool::new(false);
        let primary = match loader.load(options.model) {
            Ok(model) => Ok(model),
            Err(err) if is_corruption_error(&err.to_string()) => {
                tracing::warn!("Corrupted model detected, attempting auto-recovery: {}", err);
                recovery_attempted.store(true, Ordering::SeqCst);
                purge_quietly(loader.as_ref(), options.model);
                loader.load(options.model)
            }
            Err(err) => Err(err),
        };

        let active = match primary {
            Ok(model) => ActiveModel {
                kind: options.model,
                model,
                dimension: options.dimension,
            },
            Err(err) if options.fallback && options.model != LocalModel::AllMiniLmL6V2 => {
                tracing::warn!(
                    "{} failed to load ({}), falling back to {}",
                    options.model.name(),
                    err,
                    LocalModel::AllMiniLmL6V2.name()
                );
                fallback_model(loader.as_ref())?
            }
            Err(err) => return Err(err),
        };

        tracing::info!("Model {} loaded ({}d)", active.kind.name(), active.dimension);

        Ok(Self {
            inner: Arc::new(LocalInner {
                loader,
                active: RwLock::new(Arc::new(active)),
                recovery_lock: Mutex::new(()),
                recovery_attempted,
                fallback: options.fallback,
                max_chars: options.max_chars,
            }),
            timeout: options.timeout,
        })
    }
}

impl LocalInner {
    fn embed_blocking(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let text = truncate_to_chars(text, self.max_chars);
        let active = self.active.read().clone();
        match active.embed(&text) {
            Ok(vector) => Ok(vector),
            Err(EmbedError::ModelCorruption(message)) => self.recover(&active, &text, message),
            Err(err) if is_corruption_error(&err.to_string()) => {
                self.recover(&active, &text, err.to_string())
            }
            Err(err) => Err(err),
        }
    }

    fn recover(
        &self,
        failed: &Arc<ActiveModel>,
        text: &str,
        message: String,
    ) -> Result<Vec<f32>, EmbedError> {
        let _guard = self.recovery_lock.lock();

        // Another caller already swapped the model while we waited.
        let current = self.active.read().clone();
        if !Arc::ptr_eq(&current, failed) {
            return current.embed(text);
        }

        if !self.recovery_attempted.swap(true, Ordering::SeqCst) {
            tracing::warn!("Runtime model corruption detected, attempting reload: {}", message);
            purge_quietly(self.loader.as_ref(), current.kind);
            match self.loader.load(current.kind) {
                Ok(model) => {
                    let reloaded = Arc::new(ActiveModel {
                        kind: current.kind,
                        model,
                        dimension: current.dimension,
                    });
                    match reloaded.embed(text) {
                        Ok(vector) => {
                            *self.active.write() = reloaded;
                            return Ok(vector);
                        }
                        Err(err) => tracing::warn!("Reloaded model still failing: {}", err),
                    }
                }
                Err(err) => tracing::warn!("Model reload failed: {}", err),
            }
        }

        if !self.fallback || current.kind == LocalModel::AllMiniLmL6V2 {
            return Err(EmbedError::ModelCorruption(message));
        }

        tracing::warn!(
            "Falling back to {}; embedding dimension changes to {}",
            LocalModel::AllMiniLmL6V2.name(),
            LocalModel::AllMiniLmL6V2.native_dimension()
        );
        let degraded = Arc::new(fallback_model(self.loader.as_ref())?);
        let vector = degraded.embed(text)?;
        *self.active.write() = degraded;
        Ok(vector)
    }
}

fn fallback_model(loader: &dyn ModelLoader) -> Result<ActiveModel, EmbedError> {
    let kind = LocalModel::AllMiniLmL6V2;
    Ok(ActiveModel {
        kind,
        model: loader.load(kind)?,
        dimension: kind.native_dimension(),
    })
}

fn purge_quietly(loader: &dyn ModelLoader, model: LocalModel) {
    match loader.purge(model) {
        Ok(true) => tracing::info!("Cleared cached artifacts for {}", model.name()),
        Ok(false) => tracing::debug!("No cached artifacts found for {}", model.name()),
        Err(err) => tracing::warn!("Failed to clear model cache: {}", err),
    }
}

#[async_trait]
impl EmbeddingProvider for LocalEmbedder {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        if text.trim().is_empty() {
            return Err(EmbedError::InvalidInput);
        }
        let inner = Arc::clone(&self.inner);
        let text = text.to_string();
        let task = tokio::task::spawn_blocking(move || inner.embed_blocking(&text));
        match tokio::time::timeout(self.timeout, task).await {
            Ok(Ok(result)) => result.map(Embedding::new),
            Ok(Err(join)) => Err(EmbedError::Model(format!("inference task failed: {}", join))),
            Err(_) => Err(EmbedError::Timeout),
        }
    }

    fn model_id(&self) -> String {
        self.inner.active.read().kind.name().to_string()
    }

    fn dimension(&self) -> usize {
        self.inner.active.read().dimension
    }

    fn venue(&self) -> Venue {
        Venue::Cpu
    }
}

/// Default model cache directory.
pub fn default_model_cache_dir() -> PathBuf {
    std::env::var_os("FASTEMBED_CACHE_DIR")
        .map(PathBuf::from)
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("codescout").join("models")))
        .unwrap_or_else(|| PathBuf::from(".fastembed_cache"))
}

fn purge_cache_entries(cache_dir: &std::path::Path, fragment: &str) -> Result<bool, EmbedError> {
    let entries = match std::fs::read_dir(cache_dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(EmbedError::Model(format!("read model cache: {}", err))),
    };

    let mut removed = false;
    for entry in entries.flatten() {
        if !entry.file_name().to_string_lossy().contains(fragment) {
            continue;
        }
        let path = entry.path();
        tracing::warn!("Clearing corrupted cache: {}", path.display());
        let result = if path.is_dir() {
            std::fs::remove_dir_all(&path)
        } else {
            std::fs::remove_file(&path)
        };
        result.map_err(|err| EmbedError::Model(format!("remove {}: {}", path.display(), err)))?;
        removed = true;
    }
    Ok(removed)
}

#[cfg(not(all(target_os = "macos", target_arch = "x86_64")))]
mod fastembed_backend {
    use super::*;
    use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};

    const FASTEMBED_BATCH_SIZE: usize = 32;

    /// Loads models through fastembed (ONNX Runtime).
    pub struct FastEmbedLoader {
        cache_dir: PathBuf,
    }

    impl FastEmbedLoader {
        pub fn new(cache_dir: Option<PathBuf>) -> Self {
            Self {
                cache_dir: cache_dir.unwrap_or_else(default_model_cache_dir),
            }
        }
    }

    struct FastEmbedModel {
        embedder: Mutex<TextEmbedding>,
    }

    impl InferenceModel for FastEmbedModel {
        fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbedError> {
            let mut embedder = self.embedder.lock();
            embedder
                .embed(texts, Some(FASTEMBED_BATCH_SIZE))
                .map_err(|err| classify(format!("{:#}", err)))
        }
    }

    impl ModelLoader for FastEmbedLoader {
        fn load(&self, model: LocalModel) -> Result<Arc<dyn InferenceModel>, EmbedError> {
            let fastembed_model = match model {
                LocalModel::NomicEmbedTextV15 => EmbeddingModel::NomicEmbedTextV15,
                LocalModel::AllMiniLmL6V2 => EmbeddingModel::AllMiniLML6V2,
            };
            let init = InitOptions::new(fastembed_model)
                .with_cache_dir(self.cache_dir.clone())
                .with_show_download_progress(false);
            let embedder = TextEmbedding::try_new(init)
                .map_err(|err| classify(format!("Failed to initialize fastembed model: {:#}", err)))?;
            Ok(Arc::new(FastEmbedModel {
                embedder: Mutex::new(embedder),
            }))
        }

        fn purge(&self, model: LocalModel) -> Result<bool, EmbedError> {
            purge_cache_entries(&self.cache_dir, model.cache_fragment())
        }
    }

    fn classify(message: String) -> EmbedError {
        if is_corruption_error(&message) {
            EmbedError::ModelCorruption(message)
        } else {
            EmbedError::Model(message)
        }
    }
}

#[cfg(not(all(target_os = "macos", target_arch = "x86_64")))]
pub use fastembed_backend::FastEmbedLoader;

/// The platform's model loader.
#[cfg(not(all(target_os = "macos", target_arch = "x86_64")))]
pub fn default_loader(cache_dir: Option<PathBuf>) -> Result<Arc<dyn ModelLoader>> {
    Ok(Arc::new(FastEmbedLoader::new(cache_dir)))
}

/// The platform's model loader.
#[cfg(all(target_os = "macos", target_arch = "x86_64"))]
pub fn default_loader(_cache_dir: Option<PathBuf>) -> Result<Arc<dyn ModelLoader>> {
    anyhow::bail!(
        "Local embeddings are unavailable on this platform; configure a remote provider instead"
    )
}
