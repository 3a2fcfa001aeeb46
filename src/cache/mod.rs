// SPDX-License-Identifier: MIT OR Apache-2.0

//! Vector cache - persists embedded chunks and per-file content hashes
//!
//! Two backends share one contract:
//! - `Embedded`: SQLite plus an in-memory copy, scored by brute force
//! - `Delegated`: a Milvus collection queried through its ANN search

pub mod embedded;
pub mod hashes;
pub mod milvus;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::{Config, VectorStoreType};
use crate::errors::CacheError;

pub use embedded::{cosine_similarity, EmbeddedCache};
pub use hashes::{FileHashStore, FileRecord};
pub use milvus::{escape_filter_value, scope_filter, MilvusCache, MilvusConfig};

/// A stored slice of a source file with its embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Absolute path of the owning file
    pub file: String,
    /// Starting line number (1-indexed)
    pub start_line: u32,
    /// Ending line number (1-indexed, inclusive)
    pub end_line: u32,
    pub content: String,
    pub vector: Vec<f32>,
}

/// A retrieval candidate with its similarity score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredChunk {
    pub file: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub score: f32,
}

/// Cache size summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_chunks: u64,
    pub total_files: usize,
}

/// The configured cache backend.
pub enum VectorCache {
    Embedded(EmbeddedCache),
    Delegated(MilvusCache),
}

impl VectorCache {
    /// Backend name as shown in status output.
    pub fn kind(&self) -> &'static str {
        match self {
            VectorCache::Embedded(_) => "embedded",
            VectorCache::Delegated(_) => "milvus",
        }
    }

    pub fn directory(&self) -> &Path {
        match self {
            VectorCache::Embedded(cache) => cache.directory(),
            VectorCache::Delegated(cache) => cache.directory(),
        }
    }

    fn hashes(&self) -> &FileHashStore {
        match self {
            VectorCache::Embedded(cache) => cache.hashes(),
            VectorCache::Delegated(cache) => cache.hashes(),
        }
    }

    /// Inserts or replaces chunks keyed by (file, start_line, end_line).
    pub async fn upsert_batch(&self, chunks: Vec<Chunk>) -> Result<(), CacheError> {
        match self {
            VectorCache::Embedded(cache) => cache.upsert_batch(chunks),
            VectorCache::Delegated(cache) => cache.upsert_batch(chunks),
        }
    }

    /// Replaces all chunks of `file` with `chunks` as one write.
    pub async fn replace_file(&self, file: &str, chunks: Vec<Chunk>) -> Result<(), CacheError> {
        match self {
            VectorCache::Embedded(cache) => cache.replace_file(file, chunks),
            VectorCache::Delegated(cache) => cache.replace_file(file, chunks),
        }
    }

    pub async fn remove_file(&self, file: &str) -> Result<(), CacheError> {
        match self {
            VectorCache::Embedded(cache) => cache.remove_file(file),
            VectorCache::Delegated(cache) => cache.remove_file(file),
        }
    }

    pub fn get_file_record(&self, file: &str) -> Option<FileRecord> {
        self.hashes().get_record(file)
    }

    pub fn set_file_hash(&self, file: &str, hash: &str, mtime: Option<f64>) {
        self.hashes().set(file, hash, mtime)
    }

    /// Records `file` as partly embedded so it is retried and still owned.
    pub fn set_file_incomplete(&self, file: &str, hash: &str, mtime: Option<f64>) {
        self.hashes().set_incomplete(file, hash, mtime)
    }

    pub fn delete_file_hash(&self, file: &str) {
        self.hashes().delete(file)
    }

    pub fn all_file_hashes(&self) -> HashMap<String, FileRecord> {
        self.hashes().all()
    }

    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        match self {
            VectorCache::Embedded(cache) => Ok(cache.stats()),
            VectorCache::Delegated(cache) => cache.stats().await,
        }
    }

    /// Every stored chunk. The delegated backend never materializes its
    /// rows and returns an empty list.
    pub async fn all_chunks(&self) -> Result<Vec<Chunk>, CacheError> {
        match self {
            VectorCache::Embedded(cache) => Ok(cache.all_chunks()),
            VectorCache::Delegated(_) => Ok(Vec::new()),
        }
    }

    /// Durably flushes pending writes and file hashes.
    pub async fn persist(&self) -> Result<(), CacheError> {
        match self {
            VectorCache::Embedded(cache) => cache.persist(),
            VectorCache::Delegated(cache) => cache.persist().await,
        }
    }

    /// Drops all chunks and file records, keeping the store itself.
    pub async fn reset(&self) -> Result<(), CacheError> {
        match self {
            VectorCache::Embedded(cache) => cache.reset(),
            VectorCache::Delegated(cache) => cache.reset().await,
        }
    }

    /// Like `reset`, but the delegated backend drops and recreates its collection.
    pub async fn clear(&self) -> Result<(), CacheError> {
        match self {
            VectorCache::Embedded(cache) => cache.reset(),
            VectorCache::Delegated(cache) => cache.clear().await,
        }
    }
}

/// Opens the backend selected by `[cache].vector_store` under `cache_dir`.
///
/// The delegated backend needs the embedding dimension up front and checks
/// (or creates) its collection before returning.
pub async fn create_cache(
    config: &Config,
    cache_dir: PathBuf,
    dimension: usize,
) -> Result<VectorCache, CacheError> {
    match config.cache.vector_store() {
        VectorStoreType::Embedded => {
            let cache = tokio::task::spawn_blocking(move || EmbeddedCache::open(&cache_dir))
                .await
                .map_err(|err| CacheError::Config(format!("cache open task failed: {}", err)))??;
            Ok(VectorCache::Embedded(cache))
        }
        VectorStoreType::Milvus => {
            let address = config
                .cache
                .milvus_address
                .as_deref()
                .filter(|a| !a.trim().is_empty())
                .ok_or_else(|| {
                    CacheError::Config(
                        "Milvus vector store selected but CODESCOUT_MILVUS_ADDRESS is not set"
                            .to_string(),
                    )
                })?;
            let milvus_config = MilvusConfig {
                token: config.cache.milvus_token.clone(),
                database: config.cache.milvus_database.clone(),
                collection: config.cache.milvus_collection().to_string(),
                timeout: Duration::from_millis(config.embeddings.request_timeout_ms()),
                ..MilvusConfig::new(address, dimension)
            };
            let cache = MilvusCache::new(milvus_config, &cache_dir)?;
            cache.ensure_collection().await?;
            let stats = cache.stats().await?;
            tracing::info!(
                "Loaded Milvus cache (ANN mode): {} embeddings from {} files",
                stats.total_chunks,
                stats.total_files
            );
            Ok(VectorCache::Delegated(cache))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn embedded_cache_contract() {
        let dir = tempdir().unwrap();
        let cache = create_cache(&Config::default(), dir.path().to_path_buf(), 4)
            .await
            .unwrap();
        assert_eq!(cache.kind(), "embedded");
        assert_eq!(cache.stats().await.unwrap(), CacheStats::default());

        cache
            .upsert_batch(vec![Chunk {
                file: "/w/a.rs".into(),
                start_line: 1,
                end_line: 5,
                content: "fn a() {}".into(),
                vector: vec![0.1; 4],
            }])
            .await
            .unwrap();
        cache.set_file_hash("/w/a.rs", "h1", Some(1.0));
        cache.persist().await.unwrap();

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.total_chunks, 1);
        assert_eq!(stats.total_files, 1);
        assert_eq!(cache.get_file_record("/w/a.rs").unwrap().hash, "h1");

        cache.remove_file("/w/a.rs").await.unwrap();
        cache.delete_file_hash("/w/a.rs");
        assert!(cache.all_chunks().await.unwrap().is_empty());
        assert!(cache.all_file_hashes().is_empty());
    }

    #[tokio::test]
    async fn milvus_without_address_is_rejected() {
        let dir = tempdir().unwrap();
        let config = Config::from_toml("[cache]\nvector_store = \"milvus\"\n").unwrap();
        let result = create_cache(&config, dir.path().to_path_buf(), 8).await;
        assert!(matches!(result, Err(CacheError::Config(_))));
    }
}
