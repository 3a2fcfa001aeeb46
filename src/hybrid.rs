// SPDX-License-Identifier: MIT OR Apache-2.0

//! Hybrid search combining embedding similarity with lexical boosts.
//!
//! Candidates come from the vector cache (ANN search on the delegated
//! backend, brute-force cosine on the embedded one) and are re-ranked with
//! an exact-phrase boost or a partial word-overlap boost.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cache::{scope_filter, ScoredChunk, VectorCache};
use crate::config::SearchConfig;
use crate::embedding::EmbeddingProvider;
use crate::indexer::{Indexer, IndexingStatus};

/// Weight of the word-overlap boost when the whole query is not present.
const WORD_OVERLAP_WEIGHT: f32 = 0.3;

/// Minimum candidates requested from an ANN backend.
const MIN_ANN_CANDIDATES: usize = 20;

pub const NOT_INDEXED_MESSAGE: &str =
    "No code has been indexed yet. Please wait for initial indexing to complete.";

/// Machine-readable outcome of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SearchStatus {
    /// Ranked results (possibly empty)
    Ok,
    /// Nothing indexed yet and no run active
    NotIndexed,
    /// Nothing indexed yet but a run is active
    Indexing,
    InvalidQuery,
    Error,
}

impl std::fmt::Display for SearchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SearchStatus::Ok => write!(f, "ok"),
            SearchStatus::NotIndexed => write!(f, "not_indexed"),
            SearchStatus::Indexing => write!(f, "indexing"),
            SearchStatus::InvalidQuery => write!(f, "invalid_query"),
            SearchStatus::Error => write!(f, "error"),
        }
    }
}

/// A ranked chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    /// Absolute path as stored in the cache
    pub file: String,
    /// Path relative to the workspace root when it lies inside it
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub score: f32,
}

/// What a search returns; never an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResponse {
    pub status: SearchStatus,
    pub results: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub indexing_warning: Option<String>,
}

impl SearchResponse {
    fn advisory(status: SearchStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            results: Vec::new(),
            message: Some(message.into()),
            indexing_warning: None,
        }
    }

    /// Markdown rendering: the advisory alone, or the warning banner
    /// followed by the formatted results.
    pub fn render(&self) -> String {
        if let Some(message) = &self.message {
            return message.clone();
        }
        let mut text = String::new();
        if let Some(warning) = &self.indexing_warning {
            text.push_str(warning);
        }
        text.push_str(&format_results(&self.results));
        text
    }
}

/// Score of one candidate given its similarity `base`.
///
/// `base * semantic_weight`, plus `exact_match_boost` when the content
/// contains the whole query (case-insensitive), otherwise plus the share of
/// query words longer than two characters found in the content, times 0.3.
pub fn score_candidate(
    base: f32,
    content: &str,
    query: &str,
    semantic_weight: f32,
    exact_match_boost: f32,
) -> f32 {
    let mut score = base * semantic_weight;
    let query = query.to_lowercase();
    let content = content.to_lowercase();

    if content.contains(&query) {
        score += exact_match_boost;
    } else {
        let words: Vec<&str> = query.split_whitespace().collect();
        if !words.is_empty() {
            let matched = words
                .iter()
                .filter(|w| w.chars().count() > 2 && content.contains(*w))
                .count();
            score += (matched as f32 / words.len() as f32) * WORD_OVERLAP_WEIGHT;
        }
    }
    score
}

/// Formats hits as markdown blocks, one per result.
pub fn format_results(hits: &[SearchHit]) -> String {
    if hits.is_empty() {
        return "No matching code found for your query.".to_string();
    }

    hits.iter()
        .enumerate()
        .map(|(idx, hit)| {
            let lang = Path::new(&hit.file)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("");
            format!(
                "## Result {} (Relevance: {:.1}%)\n**File:** `{}`\n**Lines:** {}-{}\n\n```{}\n{}\n```\n",
                idx + 1,
                hit.score * 100.0,
                hit.path,
                hit.start_line,
                hit.end_line,
                lang,
                hit.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn in_progress_message(status: &IndexingStatus) -> String {
    format!(
        "Indexing in progress ({}% complete). Search available but results may be incomplete. Please wait for indexing to finish for full coverage.",
        status.percentage
    )
}

fn warning_banner(status: &IndexingStatus) -> String {
    format!(
        "⚠️ Indexing in progress ({}% complete). Results shown are from partially indexed codebase.\n\n",
        status.percentage
    )
}

/// Query engine over one workspace's cache.
pub struct HybridSearch {
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<VectorCache>,
    root: PathBuf,
    semantic_weight: f32,
    exact_match_boost: f32,
    default_max_results: usize,
    indexer: Option<Arc<Indexer>>,
}

impl HybridSearch {
    pub fn new(
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<VectorCache>,
        root: impl AsRef<Path>,
        config: &SearchConfig,
    ) -> Self {
        Self {
            provider,
            cache,
            root: root.as_ref().to_path_buf(),
            semantic_weight: config.semantic_weight(),
            exact_match_boost: config.exact_match_boost(),
            default_max_results: config.max_results(),
            indexer: None,
        }
    }

    /// Lets search report indexing progress.
    pub fn with_indexer(mut self, indexer: Arc<Indexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    fn indexing(&self) -> Option<IndexingStatus> {
        self.indexer
            .as_ref()
            .map(|indexer| indexer.status())
            .filter(|status| status.in_progress)
    }

    /// Ranked chunks for `query`.
    ///
    /// `scope` restricts results to files under a path prefix; relative
    /// prefixes are resolved against the workspace root.
    pub async fn search(
        &self,
        query: &str,
        max_results: Option<usize>,
        scope: Option<&str>,
    ) -> SearchResponse {
        let query = query.trim();
        if query.is_empty() {
            return SearchResponse::advisory(SearchStatus::InvalidQuery, "Query must not be empty.");
        }
        let max_results = max_results
            .filter(|n| *n > 0)
            .unwrap_or(self.default_max_results);
        let scope = scope
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| self.resolve_scope(s));

        let indexing = self.indexing();

        let embedding = match self.provider.embed(query).await {
            Ok(embedding) => embedding,
            Err(err) => {
                tracing::warn!("Query embedding failed: {}", err);
                return SearchResponse::advisory(
                    SearchStatus::Error,
                    format!("Search failed: could not embed query ({})", err),
                );
            }
        };

        let candidates = match self
            .candidates(&embedding.vector, max_results, scope.as_deref(), indexing.as_ref())
            .await
        {
            Ok(Ok(candidates)) => candidates,
            Ok(Err(advisory)) => return advisory,
            Err(message) => return SearchResponse::advisory(SearchStatus::Error, message),
        };

        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .map(|chunk| {
                let score = score_candidate(
                    chunk.score,
                    &chunk.content,
                    query,
                    self.semantic_weight,
                    self.exact_match_boost,
                );
                self.hit(chunk, score)
            })
            .collect();

        // sort_by is stable: equal scores keep retrieval order.
        hits.sort_by(|a, b| b.score.total_cmp(&a.score));
        hits.truncate(max_results);

        if hits.is_empty() {
            if let Some(advisory) = self.empty_cache_advisory(indexing.as_ref()).await {
                return advisory;
            }
        }

        SearchResponse {
            status: SearchStatus::Ok,
            results: hits,
            message: None,
            indexing_warning: indexing.as_ref().map(warning_banner),
        }
    }

    /// Raw candidates, or an advisory when the embedded store is empty.
    async fn candidates(
        &self,
        query: &[f32],
        max_results: usize,
        scope: Option<&str>,
        indexing: Option<&IndexingStatus>,
    ) -> Result<Result<Vec<ScoredChunk>, SearchResponse>, String> {
        match self.cache.as_ref() {
            VectorCache::Embedded(cache) => {
                if cache.stats().total_chunks == 0 {
                    return Ok(Err(not_indexed(indexing)));
                }
                cache.score_all(query, scope).map(Ok).map_err(|err| {
                    tracing::warn!("Embedded search failed: {}", err);
                    format!(
                        "Search failed: {}. Re-index with --force after changing the embedding model.",
                        err
                    )
                })
            }
            VectorCache::Delegated(cache) => {
                let top_k = (max_results * 5).max(MIN_ANN_CANDIDATES);
                let filter = scope.map(scope_filter);
                cache
                    .search_by_vector(query, top_k, filter.as_deref())
                    .await
                    .map(Ok)
                    .map_err(|err| {
                        tracing::warn!("Vector search failed: {}", err);
                        format!("Search failed: {}", err)
                    })
            }
        }
    }

    async fn empty_cache_advisory(&self, indexing: Option<&IndexingStatus>) -> Option<SearchResponse> {
        let total = match self.cache.stats().await {
            Ok(stats) => stats.total_chunks,
            Err(err) => {
                tracing::debug!("Stats unavailable after empty search: {}", err);
                0
            }
        };
        (total == 0).then(|| not_indexed(indexing))
    }

    fn resolve_scope(&self, scope: &str) -> String {
        let path = Path::new(scope);
        if path.is_absolute() {
            scope.to_string()
        } else {
            self.root.join(path).to_string_lossy().into_owned()
        }
    }

    fn hit(&self, chunk: ScoredChunk, score: f32) -> SearchHit {
        let path = Path::new(&chunk.file)
            .strip_prefix(&self.root)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| chunk.file.clone());
        SearchHit {
            file: chunk.file,
            path,
            start_line: chunk.start_line,
            end_line: chunk.end_line,
            content: chunk.content,
            score,
        }
    }
}

fn not_indexed(indexing: Option<&IndexingStatus>) -> SearchResponse {
    match indexing {
        Some(status) => SearchResponse::advisory(SearchStatus::Indexing, in_progress_message(status)),
        None => SearchResponse::advisory(SearchStatus::NotIndexed, NOT_INDEXED_MESSAGE),
    }
}
