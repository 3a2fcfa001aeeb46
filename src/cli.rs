// SPDX-License-Identifier: MIT OR Apache-2.0

//! CLI argument parsing using clap

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// codescout - Local-first semantic code search
///
/// Indexes a workspace into a vector cache and answers natural-language
/// queries with ranked code chunks.
#[derive(Parser, Debug)]
#[command(name = "codescout")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (text or json)
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,

    /// Compact JSON output (no pretty formatting)
    #[arg(long, global = true)]
    pub compact: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for results
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build or update the vector index
    Index {
        /// Workspace to index (defaults to current directory)
        #[arg(short, long)]
        path: Option<String>,

        /// Re-embed every file, ignoring stored hashes
        #[arg(short, long)]
        force: bool,
    },

    /// Semantic search over the indexed workspace
    Search {
        /// Search query (natural language or identifiers)
        query: String,

        /// Workspace to search (defaults to current directory)
        #[arg(short, long)]
        path: Option<String>,

        /// Maximum number of results
        #[arg(short = 'm', long = "max-results")]
        max_results: Option<usize>,

        /// Only return files under this path prefix
        #[arg(short, long)]
        scope: Option<String>,
    },

    /// Show index, cache and embedder status
    Status {
        /// Workspace (defaults to current directory)
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Delete all cached embeddings and file hashes
    Clear {
        /// Workspace (defaults to current directory)
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
