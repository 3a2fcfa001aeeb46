// SPDX-License-Identifier: MIT OR Apache-2.0

//! codescout - Local-first semantic code search tool
//!
//! Embeds a workspace into a vector cache and ranks code chunks by
//! semantic similarity plus lexical boosts.

mod cli;
mod commands;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Commands};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with CODESCOUT_LOG env var (e.g., CODESCOUT_LOG=debug codescout index)
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_env("CODESCOUT_LOG").unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    let format = cli.format;
    let compact = cli.compact;

    match cli.command {
        Commands::Index { path, force } => {
            commands::index(path.as_deref(), force, format, compact).await?;
        }
        Commands::Search {
            query,
            path,
            max_results,
            scope,
        } => {
            commands::search(
                &query,
                path.as_deref(),
                max_results,
                scope.as_deref(),
                format,
                compact,
            )
            .await?;
        }
        Commands::Status { path } => {
            commands::status(path.as_deref(), format, compact).await?;
        }
        Commands::Clear { path } => {
            commands::clear(path.as_deref(), format, compact).await?;
        }
        Commands::Completions { shell } => {
            let mut cmd = Cli::command();
            generate(shell, &mut cmd, "codescout", &mut std::io::stdout());
        }
    }

    Ok(())
}
