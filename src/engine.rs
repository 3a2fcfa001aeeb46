// SPDX-License-Identifier: MIT OR Apache-2.0

//! Workspace facade tying provider, cache, indexer and search together.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{create_cache, CacheStats, VectorCache};
use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::errors::{CacheError, IndexError};
use crate::hybrid::{HybridSearch, SearchResponse};
use crate::indexer::{ClearOutcome, IndexOutcome, Indexer, IndexingStatus, StartOutcome};

/// Index state as shown by `status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexState {
    Ready,
    Indexing,
    Empty,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSection {
    pub status: IndexState,
    pub files_indexed: usize,
    pub chunks_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progressive_indexing: Option<IndexingStatus>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSection {
    #[serde(rename = "type")]
    pub kind: String,
    pub directory: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingSection {
    pub provider: String,
    pub model: String,
    pub dimension: usize,
    pub venue: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchSection {
    pub semantic_weight: f32,
    pub exact_match_boost: f32,
    pub max_results: usize,
}

/// Snapshot of the whole service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub version: String,
    pub workspace: PathBuf,
    pub index: IndexSection,
    pub cache: CacheSection,
    pub embedding: EmbeddingSection,
    pub search: SearchSection,
}

/// Semantic code search over one workspace.
pub struct CodeSearch {
    root: PathBuf,
    config: Config,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<VectorCache>,
    indexer: Arc<Indexer>,
    search: HybridSearch,
}

impl CodeSearch {
    /// Builds the configured provider and cache for `workspace`.
    pub async fn open(workspace: impl AsRef<Path>, config: Config) -> Result<Self> {
        let workspace = workspace.as_ref();
        let provider = create_provider(&config).await?;
        let cache_dir = config.cache_directory(workspace);
        let cache = create_cache(&config, cache_dir.clone(), provider.dimension())
            .await
            .with_context(|| format!("Failed to open cache at {}", cache_dir.display()))?;
        Self::from_parts(workspace, config, provider, Arc::new(cache))
    }

    /// Assembles a facade from an existing provider and cache.
    pub fn from_parts(
        workspace: impl AsRef<Path>,
        config: Config,
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<VectorCache>,
    ) -> Result<Self> {
        let indexer = Arc::new(Indexer::new(
            workspace.as_ref(),
            Arc::clone(&provider),
            Arc::clone(&cache),
            &config,
        )?);
        let root = indexer.root().to_path_buf();
        let search = HybridSearch::new(Arc::clone(&provider), Arc::clone(&cache), &root, &config.search)
            .with_indexer(Arc::clone(&indexer));

        Ok(Self {
            root,
            config,
            provider,
            cache,
            indexer,
            search,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    /// Kicks off a background run; rejected while one is active.
    pub fn start_indexing(&self, force: bool) -> StartOutcome {
        self.indexer.start_indexing(force)
    }

    /// Runs indexing on the current task.
    pub async fn index_all(&self, force: bool) -> Result<IndexOutcome, IndexError> {
        self.indexer.index_all(force).await
    }

    pub fn indexing_status(&self) -> IndexingStatus {
        self.indexer.status()
    }

    pub async fn search(
        &self,
        query: &str,
        max_results: Option<usize>,
        scope: Option<&str>,
    ) -> SearchResponse {
        self.search.search(query, max_results, scope).await
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        self.cache.stats().await
    }

    pub async fn clear_cache(&self) -> Result<ClearOutcome, IndexError> {
        self.indexer.clear_cache().await
    }

    /// Stops background indexing and flushes the cache.
    pub async fn shutdown(&self) -> Result<(), CacheError> {
        self.indexer.shutdown();
        self.cache.persist().await
    }

    pub async fn status_report(&self) -> StatusReport {
        let (files_indexed, chunks_count) = match self.cache.stats().await {
            Ok(stats) => (stats.total_files, stats.total_chunks),
            Err(err) => {
                tracing::debug!("Stats unavailable, counting stored chunks: {}", err);
                self.count_from_chunks().await
            }
        };

        let progress = self.indexer.status();
        let status = if progress.in_progress {
            IndexState::Indexing
        } else if chunks_count == 0 {
            IndexState::Empty
        } else {
            IndexState::Ready
        };

        StatusReport {
            version: env!("CARGO_PKG_VERSION").to_string(),
            workspace: self.root.clone(),
            index: IndexSection {
                status,
                files_indexed,
                chunks_count,
                progressive_indexing: progress.in_progress.then_some(progress),
            },
            cache: CacheSection {
                kind: self.cache.kind().to_string(),
                directory: self.cache.directory().to_path_buf(),
            },
            embedding: EmbeddingSection {
                provider: self.config.embeddings.provider().to_string(),
                model: self.provider.model_id(),
                dimension: self.provider.dimension(),
                venue: self.provider.venue().to_string(),
            },
            search: SearchSection {
                semantic_weight: self.config.search.semantic_weight(),
                exact_match_boost: self.config.search.exact_match_boost(),
                max_results: self.config.search.max_results(),
            },
        }
    }

    async fn count_from_chunks(&self) -> (usize, u64) {
        match self.cache.all_chunks().await {
            Ok(chunks) => {
                let mut files: Vec<&str> = chunks.iter().map(|c| c.file.as_str()).collect();
                files.sort_unstable();
                files.dedup();
                (files.len(), chunks.len() as u64)
            }
            Err(_) => (0, 0),
        }
    }
}
