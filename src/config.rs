// SPDX-License-Identifier: MIT OR Apache-2.0

//! Configuration file support for codescout
//!
//! Loads configuration from .codescout.toml in the workspace root or
//! ~/.config/codescout/config.toml, then applies `CODESCOUT_*` environment
//! overrides.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::throttle::WorkerRequest;

/// Name of the per-workspace cache directory
pub const CACHE_DIR_NAME: &str = ".codescout";

/// Name of the per-workspace config file
pub const CONFIG_FILE_NAME: &str = ".codescout.toml";

/// Embedding provider type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbeddingProviderType {
    /// In-process fastembed inference
    #[default]
    Local,
    Openai,
    OpenaiCompatible,
    Gemini,
    Vertex,
    /// Deterministic hash-seeded vectors (testing)
    Dummy,
}

impl std::fmt::Display for EmbeddingProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Local => "local",
            Self::Openai => "openai",
            Self::OpenaiCompatible => "openai-compatible",
            Self::Gemini => "gemini",
            Self::Vertex => "vertex",
            Self::Dummy => "dummy",
        };
        f.write_str(name)
    }
}

impl FromStr for EmbeddingProviderType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "openai" => Ok(Self::Openai),
            "openai-compatible" => Ok(Self::OpenaiCompatible),
            "gemini" => Ok(Self::Gemini),
            "vertex" => Ok(Self::Vertex),
            "dummy" => Ok(Self::Dummy),
            other => Err(format!("Unknown embedding provider: {}", other)),
        }
    }
}

/// Vector store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VectorStoreType {
    /// SQLite-backed store with in-process brute-force similarity
    #[default]
    #[serde(alias = "sqlite")]
    Embedded,
    /// Delegated ANN search through a Milvus server
    Milvus,
}

impl FromStr for VectorStoreType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "embedded" | "sqlite" => Ok(Self::Embedded),
            "milvus" => Ok(Self::Milvus),
            other => Err(format!("Unknown vector store: {}", other)),
        }
    }
}

/// Embedding configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// Provider type (local, openai, openai-compatible, gemini, vertex, dummy)
    pub provider: Option<EmbeddingProviderType>,
    /// Model identifier
    pub model: Option<String>,
    /// Output dimension
    pub dimension: Option<usize>,
    /// Whether the local provider may degrade to MiniLM after unrecoverable corruption
    pub fallback: Option<bool>,
    /// Directory for downloaded model artifacts
    pub model_cache_dir: Option<PathBuf>,
    /// Maximum characters of a single text sent to the model
    pub max_chars: Option<usize>,
    /// Remote micro-batch size
    pub batch_size: Option<usize>,
    /// Remote micro-batch idle flush in milliseconds
    pub batch_flush_ms: Option<u64>,
    /// Remote retry ceiling
    pub max_retries: Option<u32>,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: Option<u64>,
    /// API key or bearer token
    pub api_key: Option<String>,
    /// Base URL for OpenAI-compatible endpoints
    pub base_url: Option<String>,
    /// Vertex project id
    pub vertex_project: Option<String>,
    /// Vertex location
    pub vertex_location: Option<String>,
}

impl EmbeddingConfig {
    /// Get provider type (defaults to Local)
    pub fn provider(&self) -> EmbeddingProviderType {
        self.provider.unwrap_or_default()
    }

    /// Get model identifier, falling back to the provider's default
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref().filter(|m| !m.trim().is_empty())
    }

    /// Get fallback flag (defaults to true)
    pub fn fallback(&self) -> bool {
        self.fallback.unwrap_or(true)
    }

    /// Get max chars per text (defaults to 8000)
    pub fn max_chars(&self) -> usize {
        self.max_chars.filter(|v| *v > 0).unwrap_or(8000)
    }

    /// Get batch size (defaults to 24, clamped to 1..=128)
    pub fn batch_size(&self) -> usize {
        clamp_with_warning("embeddings.batch_size", self.batch_size.unwrap_or(24), 1, 128)
    }

    /// Get flush interval (defaults to 12ms, clamped to 0..=1000)
    pub fn batch_flush_ms(&self) -> u64 {
        clamp_with_warning(
            "embeddings.batch_flush_ms",
            self.batch_flush_ms.unwrap_or(12),
            0,
            1000,
        )
    }

    /// Get retry ceiling (defaults to 3, clamped to 0..=10)
    pub fn max_retries(&self) -> u32 {
        clamp_with_warning("embeddings.max_retries", self.max_retries.unwrap_or(3), 0, 10)
    }

    /// Get request timeout (defaults to 30s)
    pub fn request_timeout_ms(&self) -> u64 {
        self.request_timeout_ms.filter(|v| *v > 0).unwrap_or(30_000)
    }
}

/// Vector cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Backend (embedded or milvus)
    pub vector_store: Option<VectorStoreType>,
    /// Cache directory (defaults to <workspace>/.codescout)
    pub directory: Option<PathBuf>,
    /// Milvus server address, e.g. http://127.0.0.1:19530
    pub milvus_address: Option<String>,
    /// Milvus token
    pub milvus_token: Option<String>,
    /// Milvus database name
    pub milvus_database: Option<String>,
    /// Milvus collection name
    pub milvus_collection: Option<String>,
}

impl CacheConfig {
    /// Get vector store (defaults to Embedded)
    pub fn vector_store(&self) -> VectorStoreType {
        self.vector_store.unwrap_or_default()
    }

    /// Get Milvus collection (defaults to "codescout_embeddings")
    pub fn milvus_collection(&self) -> &str {
        self.milvus_collection
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .unwrap_or("codescout_embeddings")
    }
}

/// Search configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Multiplier applied to the semantic similarity
    pub semantic_weight: Option<f32>,
    /// Boost added when the content contains the whole query
    pub exact_match_boost: Option<f32>,
    /// Default number of results
    pub max_results: Option<usize>,
}

impl SearchConfig {
    /// Get semantic weight (defaults to 0.7)
    pub fn semantic_weight(&self) -> f32 {
        self.semantic_weight.unwrap_or(0.7)
    }

    /// Get exact match boost (defaults to 1.5)
    pub fn exact_match_boost(&self) -> f32 {
        self.exact_match_boost.unwrap_or(1.5)
    }

    /// Get max results (defaults to 5)
    pub fn max_results(&self) -> usize {
        self.max_results.filter(|v| *v > 0).unwrap_or(5)
    }
}

/// Indexing configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Glob patterns to exclude from indexing
    pub exclude_patterns: Vec<String>,
    /// File extensions to index (defaults to a common source set)
    pub extensions: Option<Vec<String>>,
    /// Maximum file size in bytes to index (default: 1MB)
    pub max_file_size: Option<u64>,
    /// Number of lines per chunk
    pub chunk_lines: Option<usize>,
    /// Number of overlap lines between chunks
    pub chunk_overlap: Option<usize>,
    /// Minimum chunk size in characters
    pub min_chunk_size: Option<usize>,
}

impl IndexConfig {
    /// Get exclude patterns
    pub fn exclude_patterns(&self) -> &[String] {
        &self.exclude_patterns
    }

    /// Get max file size (default: 1MB)
    pub fn max_file_size(&self) -> u64 {
        self.max_file_size.unwrap_or(1024 * 1024)
    }

    /// Get chunk lines (defaults to 25)
    pub fn chunk_lines(&self) -> usize {
        self.chunk_lines.filter(|v| *v > 0).unwrap_or(25)
    }

    /// Get chunk overlap (defaults to 5)
    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap.unwrap_or(5)
    }

    /// Get min chunk size (defaults to 30)
    pub fn min_chunk_size(&self) -> usize {
        self.min_chunk_size.unwrap_or(30)
    }
}

/// Resource throttling configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Worker count: "auto" or an explicit integer
    pub max_workers: Option<WorkerRequest>,
    /// Delay between worker batches in milliseconds
    pub batch_delay_ms: Option<u64>,
}

impl ThrottleConfig {
    /// Get requested workers (defaults to auto)
    pub fn max_workers(&self) -> WorkerRequest {
        self.max_workers.clone().unwrap_or_default()
    }

    /// Get batch delay (defaults to 10ms)
    pub fn batch_delay_ms(&self) -> u64 {
        self.batch_delay_ms.unwrap_or(10)
    }
}

/// Configuration loaded from .codescout.toml or ~/.config/codescout/config.toml
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Embedding configuration
    #[serde(default)]
    pub embeddings: EmbeddingConfig,

    /// Vector cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Search configuration
    #[serde(default)]
    pub search: SearchConfig,

    /// Index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Throttle configuration
    #[serde(default)]
    pub throttle: ThrottleConfig,
}

impl Config {
    /// Load configuration for a workspace
    ///
    /// Precedence (highest to lowest):
    /// 1. `CODESCOUT_*` environment variables
    /// 2. .codescout.toml in the workspace root
    /// 3. ~/.config/codescout/config.toml
    pub fn load(workspace: &Path) -> Result<Self> {
        let mut config = Self::load_from_path(&workspace.join(CONFIG_FILE_NAME))
            .or_else(|| {
                dirs::home_dir().and_then(|home| {
                    Self::load_from_path(&home.join(".config").join("codescout").join("config.toml"))
                })
            })
            .unwrap_or_default();

        config.apply_env()?;
        Ok(config)
    }

    fn load_from_path(path: &Path) -> Option<Self> {
        let content = std::fs::read_to_string(path).ok()?;
        match toml::from_str(&content) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("Failed to parse {}: {}", path.display(), e);
                None
            }
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse codescout configuration")
    }

    /// Apply `CODESCOUT_*` environment overrides
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(raw) = read_env("CODESCOUT_EMBEDDING_PROVIDER")? {
            self.embeddings.provider = Some(raw.parse().map_err(anyhow::Error::msg)?);
        }
        if let Some(raw) = read_env("CODESCOUT_EMBEDDING_MODEL")? {
            self.embeddings.model = Some(raw);
        }
        if let Some(value) = parse_env::<usize>("CODESCOUT_EMBEDDING_DIMENSION")? {
            self.embeddings.dimension = Some(value);
        }
        if let Some(value) = parse_env::<usize>("CODESCOUT_BATCH_SIZE")? {
            self.embeddings.batch_size = Some(value);
        }
        if let Some(value) = parse_env::<u64>("CODESCOUT_BATCH_FLUSH_MS")? {
            self.embeddings.batch_flush_ms = Some(value);
        }
        if let Some(value) = parse_env::<u32>("CODESCOUT_MAX_RETRIES")? {
            self.embeddings.max_retries = Some(value);
        }
        if let Some(raw) = read_env("CODESCOUT_EMBEDDING_API_KEY")? {
            self.embeddings.api_key = Some(raw);
        }
        if let Some(raw) = read_env("CODESCOUT_EMBEDDING_BASE_URL")? {
            self.embeddings.base_url = Some(raw);
        }
        if let Some(raw) = read_env("CODESCOUT_VECTOR_STORE")? {
            self.cache.vector_store = Some(raw.parse().map_err(anyhow::Error::msg)?);
        }
        if let Some(raw) = read_env("CODESCOUT_MILVUS_ADDRESS")? {
            self.cache.milvus_address = Some(raw);
        }
        if let Some(raw) = read_env("CODESCOUT_MILVUS_TOKEN")? {
            self.cache.milvus_token = Some(raw);
        }
        if let Some(raw) = read_env("CODESCOUT_MAX_WORKERS")? {
            self.throttle.max_workers = Some(raw.parse().map_err(anyhow::Error::msg)?);
        }
        Ok(())
    }

    /// Resolve the cache directory for a workspace
    pub fn cache_directory(&self, workspace: &Path) -> PathBuf {
        match &self.cache.directory {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => workspace.join(dir),
            None => workspace.join(CACHE_DIR_NAME),
        }
    }

    /// Resolve the API key for remote providers, consulting the
    /// provider's conventional environment variable last
    pub fn api_key(&self) -> Option<String> {
        if let Some(key) = self.embeddings.api_key.as_deref() {
            if !key.trim().is_empty() {
                return Some(key.trim().to_string());
            }
        }
        let var = match self.embeddings.provider() {
            EmbeddingProviderType::Openai => "OPENAI_API_KEY",
            EmbeddingProviderType::OpenaiCompatible => "EMBEDDING_API_KEY",
            EmbeddingProviderType::Gemini => "GEMINI_API_KEY",
            EmbeddingProviderType::Vertex => "VERTEX_ACCESS_TOKEN",
            _ => return None,
        };
        env::var(var)
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }
}

fn read_env(name: &str) -> Result<Option<String>> {
    match env::var(name) {
        Ok(raw) => {
            let value = raw.trim();
            if value.is_empty() {
                Ok(None)
            } else {
                Ok(Some(value.to_string()))
            }
        }
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err).with_context(|| format!("Failed to read {}", name)),
    }
}

fn parse_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match read_env(name)? {
        Some(value) => match value.parse::<T>() {
            Ok(parsed) => Ok(Some(parsed)),
            Err(err) => bail!("Invalid {} value '{}': {}", name, value, err),
        },
        None => Ok(None),
    }
}

fn clamp_with_warning<T>(name: &str, value: T, min: T, max: T) -> T
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if value < min {
        tracing::warn!("{}={} is below min {}; clamping.", name, value, min);
        min
    } else if value > max {
        tracing::warn!("{}={} exceeds max {}; clamping.", name, value, max);
        max
    } else {
        value
    }
}
