// SPDX-License-Identifier: MIT OR Apache-2.0

//! Incremental indexer: hash-diffs the workspace and embeds changed files
//! on a bounded pool of workers.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;

use super::scanner::FileScanner;
use super::status::{Busy, IndexingStatus, RunGuard, StatusCell};
use crate::cache::{Chunk, VectorCache};
use crate::config::Config;
use crate::embedding::{ChunkConfig, EmbeddingChunker, EmbeddingProvider};
use crate::errors::IndexError;
use crate::throttle::ResourceThrottle;

/// Counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexSummary {
    /// Files found by the scanner
    pub total_files: usize,
    pub new_files: usize,
    pub updated_files: usize,
    /// Unchanged since the last run
    pub skipped_files: usize,
    pub deleted_files: usize,
    pub failed_files: usize,
    pub chunks_indexed: usize,
    pub failed_chunks: usize,
    pub cancelled: bool,
    pub duration_ms: u64,
}

/// Result of asking for a background run.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started { force: bool },
    Rejected { message: String, progress: IndexingStatus },
}

impl StartOutcome {
    pub fn accepted(&self) -> bool {
        matches!(self, StartOutcome::Started { .. })
    }

    /// Wire shape returned to tool callers.
    pub fn to_json(&self) -> Value {
        match self {
            StartOutcome::Started { force } => json!({
                "accepted": true,
                "status": "started",
                "force": force,
                "message": "Indexing started in the background. Use the status command to follow progress.",
            }),
            StartOutcome::Rejected { message, progress } => json!({
                "accepted": false,
                "status": "rejected",
                "message": message,
                "progress": progress,
            }),
        }
    }
}

/// Result of a foreground run.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexOutcome {
    Completed(IndexSummary),
    Rejected { message: String, progress: IndexingStatus },
}

/// Result of a cache clear.
#[derive(Debug, Clone, PartialEq)]
pub enum ClearOutcome {
    Cleared,
    /// Indexing is running; nothing was touched
    RejectedIndexing(IndexingStatus),
    /// Another clear is already running
    RejectedClearing,
}

impl ClearOutcome {
    pub fn message(&self) -> String {
        match self {
            ClearOutcome::Cleared => "Cache cleared successfully".to_string(),
            ClearOutcome::RejectedIndexing(status) => format!(
                "Cannot clear cache while indexing is in progress ({}% complete)",
                status.percentage
            ),
            ClearOutcome::RejectedClearing => "Cache clear already in progress".to_string(),
        }
    }
}

fn busy_message(busy: &Busy) -> (String, IndexingStatus) {
    match busy {
        Busy::Indexing(status) => (
            format!(
                "Indexing already in progress ({}% complete, {}/{} files)",
                status.percentage, status.processed_files, status.total_files
            ),
            status.clone(),
        ),
        Busy::Clearing => (
            "Cache clear in progress, try again shortly".to_string(),
            IndexingStatus::default(),
        ),
    }
}

/// A changed file queued for embedding. Workers read its content.
#[derive(Debug)]
struct FileJob {
    path: PathBuf,
    key: String,
}

struct FileResult {
    path: String,
    hash: String,
    mtime: Option<f64>,
    chunks: Vec<Chunk>,
    /// Chunks the chunker produced for the file
    produced: usize,
    failed: usize,
    aborted: bool,
    unreadable: bool,
}

#[derive(Debug, Default)]
struct Prepared {
    jobs: Vec<FileJob>,
    new_files: usize,
    updated_files: usize,
    skipped_files: usize,
    unreadable: usize,
}

/// Builds and maintains the vector cache for one workspace.
pub struct Indexer {
    root: PathBuf,
    provider: Arc<dyn EmbeddingProvider>,
    cache: Arc<VectorCache>,
    chunker: Arc<EmbeddingChunker>,
    scanner: FileScanner,
    throttle: ResourceThrottle,
    status: Arc<StatusCell>,
    shutdown: CancellationToken,
}

impl Indexer {
    pub fn new(
        root: impl AsRef<Path>,
        provider: Arc<dyn EmbeddingProvider>,
        cache: Arc<VectorCache>,
        config: &Config,
    ) -> Result<Self, IndexError> {
        let root = root.as_ref();
        let root = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());

        let index = &config.index;
        let chunk_config = ChunkConfig::new(index.chunk_lines(), index.chunk_overlap())
            .map_err(|e| IndexError::Config(e.to_string()))?
            .with_min_chunk_size(index.min_chunk_size())
            .with_max_file_bytes(index.max_file_size() as usize);

        let throttle = ResourceThrottle::new(
            &config.throttle.max_workers(),
            std::time::Duration::from_millis(config.throttle.batch_delay_ms()),
        );

        let cache_dir = std::fs::canonicalize(cache.directory())
            .unwrap_or_else(|_| cache.directory().to_path_buf());

        Ok(Self {
            scanner: FileScanner::from_config(&root, index).with_skip_dir(cache_dir),
            root,
            provider,
            cache,
            chunker: Arc::new(EmbeddingChunker::new(chunk_config)),
            throttle,
            status: StatusCell::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// Replaces the throttle (worker count and pacing).
    pub fn with_throttle(mut self, throttle: ResourceThrottle) -> Self {
        self.throttle = throttle;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache(&self) -> &Arc<VectorCache> {
        &self.cache
    }

    pub fn status(&self) -> IndexingStatus {
        self.status.snapshot()
    }

    pub fn is_indexing(&self) -> bool {
        self.status.is_indexing()
    }

    /// Stops the active run, if any. Later runs are cancelled immediately.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Starts a run in the background and returns at once.
    pub fn start_indexing(self: &Arc<Self>, force: bool) -> StartOutcome {
        let guard = match self.status.begin_run() {
            Ok(guard) => guard,
            Err(busy) => {
                let (message, progress) = busy_message(&busy);
                tracing::info!("Indexing request rejected: {}", message);
                return StartOutcome::Rejected { message, progress };
            }
        };

        let indexer = Arc::clone(self);
        tokio::spawn(async move {
            match indexer.run(guard, force).await {
                Ok(summary) => tracing::info!(
                    "Background indexing finished: {} new, {} updated, {} unchanged, {} failed",
                    summary.new_files,
                    summary.updated_files,
                    summary.skipped_files,
                    summary.failed_files
                ),
                Err(err) => tracing::error!("Background indexing failed: {}", err),
            }
        });

        StartOutcome::Started { force }
    }

    /// Runs to completion on the current task.
    pub async fn index_all(&self, force: bool) -> Result<IndexOutcome, IndexError> {
        let guard = match self.status.begin_run() {
            Ok(guard) => guard,
            Err(busy) => {
                let (message, progress) = busy_message(&busy);
                return Ok(IndexOutcome::Rejected { message, progress });
            }
        };
        self.run(guard, force).await.map(IndexOutcome::Completed)
    }

    /// Wipes every chunk and hash unless a run or another clear is active.
    pub async fn clear_cache(&self) -> Result<ClearOutcome, IndexError> {
        let _guard = match self.status.begin_clear() {
            Ok(guard) => guard,
            Err(Busy::Indexing(status)) => return Ok(ClearOutcome::RejectedIndexing(status)),
            Err(Busy::Clearing) => return Ok(ClearOutcome::RejectedClearing),
        };
        tracing::info!("Clearing {} cache", self.cache.kind());
        self.cache.clear().await?;
        Ok(ClearOutcome::Cleared)
    }

    async fn run(&self, guard: RunGuard, force: bool) -> Result<IndexSummary, IndexError> {
        let started = Instant::now();
        let cancel = self.shutdown.child_token();

        let result = self.run_inner(&guard, force, &cancel).await;

        // Persist whatever was written, even after a failure.
        if let Err(err) = self.cache.persist().await {
            tracing::error!("Failed to persist cache: {}", err);
            if result.is_ok() {
                return Err(err.into());
            }
        }

        let mut summary = result?;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        drop(guard);
        Ok(summary)
    }

    async fn run_inner(
        &self,
        guard: &RunGuard,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<IndexSummary, IndexError> {
        if force {
            tracing::info!("Force re-index: resetting cache");
            self.cache.reset().await?;
        }

        let scanner = self.scanner.clone();
        let files = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| IndexError::Walk(e.to_string()))??;

        let mut summary = IndexSummary {
            total_files: files.len(),
            ..IndexSummary::default()
        };

        summary.deleted_files = self.remove_deleted(&files).await?;

        let prepared = self.prepare_jobs(files, force).await;
        summary.new_files = prepared.new_files;
        summary.updated_files = prepared.updated_files;
        summary.skipped_files = prepared.skipped_files;
        summary.failed_files = prepared.unreadable;

        tracing::info!(
            "Indexing {} files ({} unchanged, {} removed)",
            prepared.jobs.len(),
            summary.skipped_files,
            summary.deleted_files
        );
        guard.set_total(prepared.jobs.len());

        if !prepared.jobs.is_empty() {
            self.embed_jobs(prepared.jobs, guard, cancel, &mut summary)
                .await?;
        }

        summary.cancelled = cancel.is_cancelled();
        Ok(summary)
    }

    /// Drops chunks and hashes of files that no longer exist.
    async fn remove_deleted(&self, files: &[PathBuf]) -> Result<usize, IndexError> {
        let present: HashSet<String> = files.iter().map(|p| path_key(p)).collect();
        let mut removed = 0;
        for file in self.cache.all_file_hashes().into_keys() {
            if present.contains(&file) {
                continue;
            }
            tracing::debug!("Removing deleted file {}", file);
            self.cache.remove_file(&file).await?;
            self.cache.delete_file_hash(&file);
            removed += 1;
        }
        Ok(removed)
    }

    async fn prepare_jobs(&self, files: Vec<PathBuf>, force: bool) -> Prepared {
        let mut prepared = Prepared::default();

        for path in files {
            let key = path_key(&path);
            let hashed = {
                let path = path.clone();
                tokio::task::spawn_blocking(move || hash_file(&path)).await
            };
            let hash = match hashed {
                Ok(Ok(hash)) => hash,
                Ok(Err(err)) => {
                    tracing::warn!("Failed to read {}: {}", path.display(), err);
                    prepared.unreadable += 1;
                    continue;
                }
                Err(err) => {
                    tracing::warn!("Hashing task for {} failed: {}", path.display(), err);
                    prepared.unreadable += 1;
                    continue;
                }
            };
            let mtime = file_mtime_ms(&path);

            match self.cache.get_file_record(&key) {
                Some(record) if !force && !record.incomplete && record.hash == hash => {
                    // Touched but unchanged: refresh the stored mtime only.
                    if record.mtime != mtime {
                        self.cache.set_file_hash(&key, &hash, mtime);
                    }
                    prepared.skipped_files += 1;
                    continue;
                }
                Some(_) => prepared.updated_files += 1,
                None => prepared.new_files += 1,
            }

            prepared.jobs.push(FileJob { path, key });
        }

        prepared
    }

    async fn embed_jobs(
        &self,
        jobs: Vec<FileJob>,
        guard: &RunGuard,
        cancel: &CancellationToken,
        summary: &mut IndexSummary,
    ) -> Result<(), IndexError> {
        let workers = self.throttle.worker_count(Some(jobs.len()));
        tracing::debug!("Spawning {} indexing workers", workers);

        let (job_tx, job_rx) = mpsc::channel::<FileJob>(workers * 2);
        let job_rx = Arc::new(AsyncMutex::new(job_rx));
        let (result_tx, mut result_rx) = mpsc::channel::<FileResult>(workers * 2);

        let mut handles = Vec::with_capacity(workers);
        for id in 0..workers {
            handles.push(tokio::spawn(worker(
                id,
                Arc::clone(&job_rx),
                result_tx.clone(),
                Arc::clone(&self.provider),
                Arc::clone(&self.chunker),
                self.throttle.clone(),
                cancel.clone(),
            )));
        }
        // Workers own the queue now; the feeder stops once they are all gone.
        drop(job_rx);
        drop(result_tx);

        let feeder_cancel = cancel.clone();
        let feeder = tokio::spawn(async move {
            for job in jobs {
                if feeder_cancel.is_cancelled() || job_tx.send(job).await.is_err() {
                    break;
                }
            }
        });

        while let Some(result) = result_rx.recv().await {
            self.record_result(result, summary).await;
            guard.advance();
        }

        feeder
            .await
            .map_err(|e| IndexError::Worker(e.to_string()))?;
        for handle in handles {
            handle.await.map_err(|e| IndexError::Worker(e.to_string()))?;
        }
        Ok(())
    }

    async fn record_result(&self, result: FileResult, summary: &mut IndexSummary) {
        summary.failed_chunks += result.failed;

        if result.aborted {
            return;
        }
        if result.unreadable {
            summary.failed_files += 1;
            return;
        }

        if result.produced > 0 && result.chunks.is_empty() {
            tracing::warn!(
                "All {} chunks failed for {}; will retry next run",
                result.failed,
                result.path
            );
            summary.failed_files += 1;
            return;
        }

        let written = result.chunks.len();
        if let Err(err) = self.cache.replace_file(&result.path, result.chunks).await {
            tracing::error!("Failed to store chunks for {}: {}", result.path, err);
            summary.failed_files += 1;
            return;
        }
        summary.chunks_indexed += written;

        if result.failed == 0 {
            self.cache
                .set_file_hash(&result.path, &result.hash, result.mtime);
        } else {
            // Keeps the stored chunks owned (and removable) until a clean run.
            self.cache
                .set_file_incomplete(&result.path, &result.hash, result.mtime);
            summary.failed_files += 1;
        }
    }
}

async fn worker(
    id: usize,
    jobs: Arc<AsyncMutex<mpsc::Receiver<FileJob>>>,
    results: mpsc::Sender<FileResult>,
    provider: Arc<dyn EmbeddingProvider>,
    chunker: Arc<EmbeddingChunker>,
    throttle: ResourceThrottle,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let job = {
            let mut rx = jobs.lock().await;
            tokio::select! {
                _ = cancel.cancelled() => None,
                job = rx.recv() => job,
            }
        };
        let Some(job) = job else { break };

        let result = throttle
            .pace(embed_file(provider.as_ref(), &chunker, job, &cancel), &cancel)
            .await;
        if results.send(result).await.is_err() {
            break;
        }
    }
    tracing::trace!("Indexing worker {} stopped", id);
}

async fn embed_file(
    provider: &dyn EmbeddingProvider,
    chunker: &EmbeddingChunker,
    job: FileJob,
    cancel: &CancellationToken,
) -> FileResult {
    let mut result = FileResult {
        path: job.key,
        hash: String::new(),
        mtime: None,
        chunks: Vec::new(),
        produced: 0,
        failed: 0,
        aborted: false,
        unreadable: false,
    };

    // Hash what is actually embedded, in case the file changed since the scan.
    let bytes = match tokio::fs::read(&job.path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!("Failed to read {}: {}", job.path.display(), err);
            result.unreadable = true;
            return result;
        }
    };
    result.hash = blake3::hash(&bytes).to_hex().to_string();
    result.mtime = file_mtime_ms(&job.path);
    let content = String::from_utf8_lossy(&bytes);

    let pieces = chunker.chunk_file(&content);
    result.produced = pieces.len();
    result.chunks.reserve(pieces.len());

    for piece in pieces {
        if cancel.is_cancelled() {
            result.aborted = true;
            break;
        }
        match provider.embed(&piece.text).await {
            Ok(embedding) => result.chunks.push(Chunk {
                file: result.path.clone(),
                start_line: piece.start_line,
                end_line: piece.end_line,
                content: piece.text,
                vector: embedding.vector,
            }),
            Err(err) => {
                tracing::debug!(
                    "Embedding failed for {}:{}-{}: {}",
                    result.path,
                    piece.start_line,
                    piece.end_line,
                    err
                );
                result.failed += 1;
            }
        }
    }

    result
}

/// Streams the file through blake3 without holding it in memory.
fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut hasher = blake3::Hasher::new();
    hasher.update_reader(std::fs::File::open(path)?)?;
    Ok(hasher.finalize().to_hex().to_string())
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// Modification time in milliseconds since the epoch.
fn file_mtime_ms(path: &Path) -> Option<f64> {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::EmbeddedCache;
    use crate::embedding::DummyProvider;
    use crate::throttle::WorkerRequest;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    const SOURCE: &str = "fn alpha() {\n    println!(\"alpha function body\");\n}\n";

    fn indexer(dir: &TempDir) -> Indexer {
        let cache_dir = dir.path().join(".codescout");
        let cache = EmbeddedCache::open(&cache_dir).unwrap();
        let cache = Arc::new(VectorCache::Embedded(cache));
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(DummyProvider::new(16));
        Indexer::new(dir.path(), provider, cache, &Config::default())
            .unwrap()
            .with_throttle(ResourceThrottle::with_cpu_count(
                2,
                &WorkerRequest::Count(2),
                Duration::ZERO,
            ))
    }

    fn completed(outcome: IndexOutcome) -> IndexSummary {
        match outcome {
            IndexOutcome::Completed(summary) => summary,
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn indexes_then_skips_unchanged_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.rs"), SOURCE).unwrap();
        fs::write(dir.path().join("b.rs"), SOURCE.replace("alpha", "beta")).unwrap();
        let indexer = indexer(&dir);

        let first = completed(indexer.index_all(false).await.unwrap());
        assert_eq!(first.total_files, 2);
        assert_eq!(first.new_files, 2);
        assert_eq!(first.chunks_indexed, 2);

        let second = completed(indexer.index_all(false).await.unwrap());
        assert_eq!(second.skipped_files, 2);
        assert_eq!(second.chunks_indexed, 0);

        let stats = indexer.cache().stats().await.unwrap();
        assert_eq!(stats.total_chunks, 2);
        assert_eq!(stats.total_files, 2);
        assert!(!indexer.is_indexing());
    }

    #[tokio::test]
    async fn removes_deleted_files() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.rs"), SOURCE).unwrap();
        fs::write(dir.path().join("b.rs"), SOURCE.replace("alpha", "beta")).unwrap();
        let indexer = indexer(&dir);
        completed(indexer.index_all(false).await.unwrap());

        fs::remove_file(dir.path().join("b.rs")).unwrap();
        let summary = completed(indexer.index_all(false).await.unwrap());
        assert_eq!(summary.deleted_files, 1);
        assert_eq!(indexer.cache().stats().await.unwrap().total_chunks, 1);
        assert_eq!(indexer.cache().all_file_hashes().len(), 1);
    }

    #[tokio::test]
    async fn tiny_files_are_recorded_without_chunks() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("tiny.rs"), "x\n").unwrap();
        let indexer = indexer(&dir);

        let summary = completed(indexer.index_all(false).await.unwrap());
        assert_eq!(summary.chunks_indexed, 0);
        assert_eq!(summary.failed_files, 0);
        assert_eq!(indexer.cache().all_file_hashes().len(), 1);
    }

    #[tokio::test]
    async fn clear_wipes_cache() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.rs"), SOURCE).unwrap();
        let indexer = indexer(&dir);
        completed(indexer.index_all(false).await.unwrap());

        assert_eq!(indexer.clear_cache().await.unwrap(), ClearOutcome::Cleared);
        assert_eq!(indexer.cache().stats().await.unwrap().total_chunks, 0);
        assert!(indexer.cache().all_file_hashes().is_empty());
    }

    #[tokio::test]
    async fn file_vanished_after_scan_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let chunker = EmbeddingChunker::new(ChunkConfig::default());
        let job = FileJob {
            path: dir.path().join("gone.rs"),
            key: "gone.rs".to_string(),
        };

        let result = embed_file(&DummyProvider::new(8), &chunker, job, &CancellationToken::new()).await;
        assert!(result.unreadable);
        assert_eq!(result.produced, 0);
        assert!(result.chunks.is_empty());
    }

    #[tokio::test]
    async fn recorded_hash_matches_embedded_content() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.rs"), SOURCE).unwrap();
        let indexer = indexer(&dir);
        completed(indexer.index_all(false).await.unwrap());

        let key = path_key(&indexer.root().join("a.rs"));
        let record = indexer.cache().get_file_record(&key).unwrap();
        assert_eq!(record.hash, blake3::hash(SOURCE.as_bytes()).to_hex().to_string());
        assert!(!record.incomplete);
    }

    #[test]
    fn start_outcome_json_shape() {
        let started = StartOutcome::Started { force: true }.to_json();
        assert_eq!(started["accepted"], true);
        assert_eq!(started["status"], "started");
        assert_eq!(started["force"], true);

        let rejected = StartOutcome::Rejected {
            message: "Indexing already in progress (10% complete, 1/10 files)".into(),
            progress: IndexingStatus {
                in_progress: true,
                total_files: 10,
                processed_files: 1,
                percentage: 10,
            },
        }
        .to_json();
        assert_eq!(rejected["accepted"], false);
        assert_eq!(rejected["status"], "rejected");
        assert_eq!(rejected["progress"]["inProgress"], true);
        assert_eq!(rejected["progress"]["totalFiles"], 10);
        assert!(rejected["message"]
            .as_str()
            .unwrap()
            .contains("already in progress"));
    }
}
