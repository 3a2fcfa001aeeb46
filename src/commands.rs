// SPDX-License-Identifier: MIT OR Apache-2.0

//! Subcommand runners for the codescout binary.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use codescout::config::Config;
use codescout::engine::StatusReport;
use codescout::hybrid::SearchStatus;
use codescout::indexer::{ClearOutcome, IndexOutcome, IndexSummary};
use codescout::output::{
    colorize_label, colorize_number, colorize_path, success_mark, to_json, use_colors,
    warning_mark,
};
use codescout::CodeSearch;

use crate::cli::OutputFormat;

/// Resolves the workspace path (defaults to the current directory).
fn workspace(path: Option<&str>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => PathBuf::from(p),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };
    if !path.is_dir() {
        bail!("Workspace is not a directory: {}", path.display());
    }
    Ok(std::fs::canonicalize(&path).unwrap_or(path))
}

async fn open(path: Option<&str>) -> Result<(PathBuf, CodeSearch)> {
    let root = workspace(path)?;
    let config = Config::load(&root)?;
    let engine = CodeSearch::open(&root, config).await?;
    Ok((root, engine))
}

pub async fn index(path: Option<&str>, force: bool, format: OutputFormat, compact: bool) -> Result<()> {
    let (root, engine) = open(path).await?;
    let engine = Arc::new(engine);

    let show_progress = format == OutputFormat::Text;
    let pb = if show_progress {
        let pb = ProgressBar::new(0);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{bar:40.cyan/blue}] {pos}/{len} files | Indexing {msg}")
                .context("Invalid progress template")?
                .progress_chars("=>-"),
        );
        pb.set_message(root.display().to_string());
        Some(pb)
    } else {
        None
    };

    let run = {
        let engine = Arc::clone(&engine);
        tokio::spawn(async move { engine.index_all(force).await })
    };

    let mut ticker = tokio::time::interval(Duration::from_millis(100));
    let mut interrupted = false;
    while !run.is_finished() {
        tokio::select! {
            _ = ticker.tick() => {
                if let Some(pb) = &pb {
                    let status = engine.indexing_status();
                    pb.set_length(status.total_files as u64);
                    pb.set_position(status.processed_files as u64);
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                tracing::warn!("Interrupted, stopping indexing workers");
                engine.indexer().shutdown();
            }
        }
    }
    if let Some(pb) = &pb {
        pb.finish_and_clear();
    }

    let outcome = run.await.context("Indexing task panicked")??;
    let summary = match outcome {
        IndexOutcome::Completed(summary) => summary,
        IndexOutcome::Rejected { message, .. } => bail!(message),
    };

    match format {
        OutputFormat::Json => println!("{}", to_json(&summary, compact)?),
        OutputFormat::Text => print_summary(&summary),
    }
    Ok(())
}

fn print_summary(summary: &IndexSummary) {
    let color = use_colors();
    let indexed = summary.new_files + summary.updated_files;
    println!(
        "{} Indexed {} files ({} unchanged, {} total)",
        success_mark(color),
        colorize_number(&indexed.to_string(), color),
        summary.skipped_files,
        summary.total_files
    );
    println!(
        "  {} chunks embedded, {} files removed in {:.1}s",
        summary.chunks_indexed,
        summary.deleted_files,
        summary.duration_ms as f64 / 1000.0
    );
    if summary.failed_files > 0 || summary.failed_chunks > 0 {
        println!(
            "{} {} files and {} chunks failed; they will be retried on the next run",
            warning_mark(color),
            summary.failed_files,
            summary.failed_chunks
        );
    }
    if summary.cancelled {
        println!("{} Indexing was cancelled before it finished", warning_mark(color));
    }
}

pub async fn search(
    query: &str,
    path: Option<&str>,
    max_results: Option<usize>,
    scope: Option<&str>,
    format: OutputFormat,
    compact: bool,
) -> Result<()> {
    if query.trim().is_empty() {
        bail!("Query must not be empty");
    }
    let (_, engine) = open(path).await?;
    let response = engine.search(query, max_results, scope).await;

    match format {
        OutputFormat::Json => println!("{}", to_json(&response, compact)?),
        OutputFormat::Text => println!("{}", response.render()),
    }

    if response.status == SearchStatus::Error {
        bail!(response.message.unwrap_or_else(|| "Search failed".to_string()));
    }
    Ok(())
}

pub async fn status(path: Option<&str>, format: OutputFormat, compact: bool) -> Result<()> {
    let (_, engine) = open(path).await?;
    let report = engine.status_report().await;
    match format {
        OutputFormat::Json => println!("{}", to_json(&report, compact)?),
        OutputFormat::Text => print_status(&report),
    }
    Ok(())
}

fn print_status(report: &StatusReport) {
    let color = use_colors();
    let index_state = serde_json::to_value(report.index.status)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default();

    println!(
        "{} {}",
        colorize_label("Workspace:", color),
        colorize_path(&report.workspace.display().to_string(), color)
    );
    println!(
        "{} {} ({} files, {} chunks)",
        colorize_label("Index:", color),
        index_state,
        colorize_number(&report.index.files_indexed.to_string(), color),
        colorize_number(&report.index.chunks_count.to_string(), color)
    );
    if let Some(progress) = &report.index.progressive_indexing {
        println!(
            "  {}/{} files ({}%)",
            progress.processed_files, progress.total_files, progress.percentage
        );
    }
    println!(
        "{} {} at {}",
        colorize_label("Cache:", color),
        report.cache.kind,
        colorize_path(&report.cache.directory.display().to_string(), color)
    );
    println!(
        "{} {} / {} ({}d, {})",
        colorize_label("Embeddings:", color),
        report.embedding.provider,
        report.embedding.model,
        report.embedding.dimension,
        report.embedding.venue
    );
}

pub async fn clear(path: Option<&str>, format: OutputFormat, compact: bool) -> Result<()> {
    let (_, engine) = open(path).await?;
    let outcome = engine.clear_cache().await?;
    let message = outcome.message();

    match format {
        OutputFormat::Json => {
            let value = serde_json::json!({
                "success": outcome == ClearOutcome::Cleared,
                "message": message,
            });
            println!("{}", to_json(&value, compact)?);
        }
        OutputFormat::Text => {
            let mark = if outcome == ClearOutcome::Cleared {
                success_mark(use_colors())
            } else {
                warning_mark(use_colors())
            };
            println!("{} {}", mark, message.normal());
        }
    }

    if outcome != ClearOutcome::Cleared {
        bail!(message);
    }
    Ok(())
}
