// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use codescout::cache::{EmbeddedCache, VectorCache};
use codescout::config::Config;
use codescout::embedding::{DummyProvider, Embedding, EmbeddingProvider, Venue};
use codescout::errors::EmbedError;
use codescout::indexer::{ClearOutcome, IndexOutcome, IndexSummary, Indexer, StartOutcome};
use codescout::throttle::{ResourceThrottle, WorkerRequest};

/// Wraps the dummy provider, counting calls, optionally slowing down and
/// failing any text that contains "poison".
struct CountingProvider {
    inner: DummyProvider,
    calls: AtomicUsize,
    delay: Duration,
}

impl CountingProvider {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: DummyProvider::new(16),
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for CountingProvider {
    async fn embed(&self, text: &str) -> Result<Embedding, EmbedError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if text.contains("poison") {
            return Err(EmbedError::TransientNetwork("upstream reset".into()));
        }
        self.inner.embed(text).await
    }

    fn model_id(&self) -> String {
        "counting".to_string()
    }

    fn dimension(&self) -> usize {
        16
    }

    fn venue(&self) -> Venue {
        Venue::Cpu
    }
}

fn write_source(root: &Path, name: &str, body: &str) {
    let path = root.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(
        path,
        format!("// {name}\nfn {body}() {{\n    println!(\"{body} does useful work\");\n}}\n"),
    )
    .unwrap();
}

fn build(root: &Path, provider: Arc<CountingProvider>, workers: usize) -> Indexer {
    let cache = EmbeddedCache::open(&root.join(".codescout")).unwrap();
    Indexer::new(
        root,
        provider,
        Arc::new(VectorCache::Embedded(cache)),
        &Config::default(),
    )
    .unwrap()
    .with_throttle(ResourceThrottle::with_cpu_count(
        8,
        &WorkerRequest::Count(workers),
        Duration::ZERO,
    ))
}

async fn run(indexer: &Indexer, force: bool) -> IndexSummary {
    match indexer.index_all(force).await.unwrap() {
        IndexOutcome::Completed(summary) => summary,
        other => panic!("unexpected {:?}", other),
    }
}

async fn wait_idle(indexer: &Indexer) {
    for _ in 0..200 {
        if !indexer.is_indexing() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("indexing did not finish");
}

#[tokio::test]
async fn unchanged_files_are_not_re_embedded() {
    let dir = TempDir::new().unwrap();
    for name in ["a", "b", "c"] {
        write_source(dir.path(), &format!("src/{name}.rs"), name);
    }
    let provider = CountingProvider::new(Duration::ZERO);
    let indexer = build(dir.path(), Arc::clone(&provider), 2);

    let first = run(&indexer, false).await;
    assert_eq!(first.new_files, 3);
    assert_eq!(first.chunks_indexed, 3);
    assert_eq!(provider.calls(), 3);

    let second = run(&indexer, false).await;
    assert_eq!(second.skipped_files, 3);
    assert_eq!(second.new_files + second.updated_files, 0);
    assert_eq!(provider.calls(), 3);
    assert_eq!(indexer.cache().stats().await.unwrap().total_chunks, 3);

    write_source(dir.path(), "src/b.rs", "b_changed");
    let third = run(&indexer, false).await;
    assert_eq!(third.updated_files, 1);
    assert_eq!(third.skipped_files, 2);
    assert_eq!(provider.calls(), 4);
    assert_eq!(indexer.cache().stats().await.unwrap().total_chunks, 3);
}

#[tokio::test]
async fn forced_run_re_embeds_everything() {
    let dir = TempDir::new().unwrap();
    for name in ["a", "b"] {
        write_source(dir.path(), &format!("{name}.rs"), name);
    }
    let provider = CountingProvider::new(Duration::ZERO);
    let indexer = build(dir.path(), Arc::clone(&provider), 1);

    run(&indexer, false).await;
    let forced = run(&indexer, true).await;

    assert_eq!(forced.new_files, 2);
    assert_eq!(forced.skipped_files, 0);
    assert_eq!(provider.calls(), 4);
    assert_eq!(indexer.cache().stats().await.unwrap().total_chunks, 2);
}

#[tokio::test]
async fn fully_failed_file_is_retried_next_run() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path(), "good.rs", "good");
    write_source(dir.path(), "bad.rs", "poison");
    let provider = CountingProvider::new(Duration::ZERO);
    let indexer = build(dir.path(), Arc::clone(&provider), 2);

    let first = run(&indexer, false).await;
    assert_eq!(first.failed_files, 1);
    assert_eq!(first.failed_chunks, 1);
    assert_eq!(first.chunks_indexed, 1);

    let hashes = indexer.cache().all_file_hashes();
    assert_eq!(hashes.len(), 1);
    assert!(hashes.keys().all(|k| k.ends_with("good.rs")));

    let second = run(&indexer, false).await;
    assert_eq!(second.skipped_files, 1);
    assert_eq!(second.new_files, 1);
    assert_eq!(second.failed_files, 1);
}

#[tokio::test]
async fn concurrent_start_and_clear_are_rejected() {
    let dir = TempDir::new().unwrap();
    for idx in 0..4 {
        write_source(dir.path(), &format!("f{idx}.rs"), &format!("func_{idx}"));
    }
    let provider = CountingProvider::new(Duration::from_millis(150));
    let indexer = Arc::new(build(dir.path(), provider, 1));

    let first = indexer.start_indexing(false);
    assert_eq!(first, StartOutcome::Started { force: false });

    match indexer.start_indexing(true) {
        StartOutcome::Rejected { message, progress } => {
            assert!(message.contains("already in progress"));
            assert!(progress.in_progress);
        }
        other => panic!("unexpected {:?}", other),
    }
    let json = indexer.start_indexing(false).to_json();
    assert_eq!(json["accepted"], false);
    assert_eq!(json["status"], "rejected");

    assert!(matches!(
        indexer.clear_cache().await.unwrap(),
        ClearOutcome::RejectedIndexing(_)
    ));

    wait_idle(&indexer).await;
    assert_eq!(indexer.cache().stats().await.unwrap().total_chunks, 4);

    assert_eq!(indexer.clear_cache().await.unwrap(), ClearOutcome::Cleared);
    let stats = indexer.cache().stats().await.unwrap();
    assert_eq!(stats.total_chunks, 0);
    assert_eq!(stats.total_files, 0);
}

#[tokio::test]
async fn shutdown_stops_workers() {
    let dir = TempDir::new().unwrap();
    for idx in 0..20 {
        write_source(dir.path(), &format!("f{idx}.rs"), &format!("func_{idx}"));
    }
    let provider = CountingProvider::new(Duration::from_millis(50));
    let indexer = Arc::new(build(dir.path(), Arc::clone(&provider), 1));

    assert!(indexer.start_indexing(false).accepted());
    tokio::time::sleep(Duration::from_millis(120)).await;
    indexer.shutdown();
    wait_idle(&indexer).await;

    assert!(provider.calls() < 20);
    assert!(indexer.cache().all_file_hashes().len() < 20);
}

/// 40 lines: the default 25/5 windows give chunks 1-25 and 21-40, and only
/// the second one contains the failing marker.
fn write_partly_failing(root: &Path, name: &str) {
    let body: String = (1..=40)
        .map(|line| {
            if line == 35 {
                "    let marker = \"poison\";\n".to_string()
            } else {
                format!("    let value_{line} = compute({line});\n")
            }
        })
        .collect();
    fs::write(root.join(name), body).unwrap();
}

#[tokio::test]
async fn partly_embedded_file_is_retried_and_removed_when_deleted() {
    let dir = TempDir::new().unwrap();
    write_partly_failing(dir.path(), "a.rs");
    let provider = CountingProvider::new(Duration::ZERO);
    let indexer = build(dir.path(), Arc::clone(&provider), 1);

    let first = run(&indexer, false).await;
    assert_eq!(first.chunks_indexed, 1);
    assert_eq!(first.failed_chunks, 1);
    assert_eq!(first.failed_files, 1);
    let records = indexer.cache().all_file_hashes();
    assert_eq!(records.len(), 1);
    assert!(records.values().all(|r| r.incomplete));

    // Unchanged content is still re-embedded while the record is incomplete.
    let second = run(&indexer, false).await;
    assert_eq!(second.updated_files, 1);
    assert_eq!(second.skipped_files, 0);
    assert_eq!(provider.calls(), 4);

    fs::remove_file(dir.path().join("a.rs")).unwrap();
    let third = run(&indexer, false).await;
    assert_eq!(third.deleted_files, 1);
    let stats = indexer.cache().stats().await.unwrap();
    assert_eq!(stats.total_chunks, 0);
    assert_eq!(stats.total_files, 0);
    assert!(indexer.cache().all_chunks().await.unwrap().is_empty());
    assert!(indexer.cache().all_file_hashes().is_empty());
}

#[tokio::test]
async fn cache_inside_workspace_is_not_indexed() {
    let dir = TempDir::new().unwrap();
    write_source(dir.path(), "src/a.rs", "alpha");
    let cache = EmbeddedCache::open(&dir.path().join("vectors")).unwrap();
    let indexer = Indexer::new(
        dir.path(),
        CountingProvider::new(Duration::ZERO),
        Arc::new(VectorCache::Embedded(cache)),
        &Config::default(),
    )
    .unwrap();

    run(&indexer, false).await;
    // file-hashes.json now exists under vectors/ and has an indexable extension.
    let second = run(&indexer, false).await;
    assert_eq!(second.total_files, 1);
    assert_eq!(second.skipped_files, 1);
    assert!(indexer
        .cache()
        .all_file_hashes()
        .keys()
        .all(|file| !file.contains("vectors")));
}
