// SPDX-License-Identifier: MIT OR Apache-2.0

//! Line-window chunking of source files.
//!
//! A file becomes a run of windows of `chunk_lines` lines, each starting
//! `chunk_lines - chunk_overlap` lines after the previous one. The walk stops
//! at the first window that reaches the last line, so a file never ends with
//! a tail window that is wholly contained in its predecessor.

use anyhow::{bail, Result};

pub const DEFAULT_CHUNK_LINES: usize = 25;
pub const DEFAULT_CHUNK_OVERLAP: usize = 5;

/// Windows whose trimmed text is shorter than this are not embedded.
pub const MIN_CHUNK_SIZE: usize = 30;

/// Files above this size produce no chunks at all.
pub const DEFAULT_MAX_FILE_BYTES: usize = 1_048_576;

/// Chunk text is cut to this many characters (the vector store's varchar limit).
pub const MAX_CHUNK_CHARS: usize = 65_535;

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    pub chunk_lines: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
    pub max_file_bytes: usize,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            chunk_lines: DEFAULT_CHUNK_LINES,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            min_chunk_size: MIN_CHUNK_SIZE,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
        }
    }
}

impl ChunkConfig {
    /// Window size and overlap; the overlap must leave a positive stride.
    pub fn new(chunk_lines: usize, chunk_overlap: usize) -> Result<Self> {
        if chunk_lines == 0 {
            bail!("chunk_lines must be at least 1");
        }
        if chunk_overlap >= chunk_lines {
            bail!(
                "chunk_overlap ({}) must be smaller than chunk_lines ({})",
                chunk_overlap,
                chunk_lines
            );
        }
        Ok(Self {
            chunk_lines,
            chunk_overlap,
            ..Default::default()
        })
    }

    pub fn with_min_chunk_size(mut self, size: usize) -> Self {
        self.min_chunk_size = size;
        self
    }

    pub fn with_max_file_bytes(mut self, size: usize) -> Self {
        self.max_file_bytes = size;
        self
    }

    fn stride(&self) -> usize {
        self.chunk_lines.saturating_sub(self.chunk_overlap).max(1)
    }
}

/// One window of a file. Line numbers are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChunk {
    pub start_line: u32,
    pub end_line: u32,
    pub text: String,
}

pub struct EmbeddingChunker {
    config: ChunkConfig,
}

impl EmbeddingChunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// Chunks a whole file. Oversized files yield nothing so they are
    /// recorded without being embedded.
    pub fn chunk_file(&self, content: &str) -> Vec<TextChunk> {
        if content.len() > self.config.max_file_bytes {
            tracing::debug!(
                "Not chunking {} byte file (limit {})",
                content.len(),
                self.config.max_file_bytes
            );
            return Vec::new();
        }
        self.chunk_text(content)
    }

    /// Splits `content` into windows, ignoring the size limit.
    pub fn chunk_text(&self, content: &str) -> Vec<TextChunk> {
        let lines: Vec<&str> = content.lines().collect();
        self.windows(lines.len())
            .filter_map(|(start, end)| {
                let text = lines[start..end].join("\n");
                (text.trim().len() >= self.config.min_chunk_size).then(|| TextChunk {
                    start_line: start as u32 + 1,
                    end_line: end as u32,
                    text: cap_chars(text, MAX_CHUNK_CHARS),
                })
            })
            .collect()
    }

    /// Half-open `[start, end)` line ranges covering `total` lines.
    fn windows(&self, total: usize) -> impl Iterator<Item = (usize, usize)> + '_ {
        let size = self.config.chunk_lines;
        let mut next = (total > 0).then_some(0);
        std::iter::from_fn(move || {
            let start = next?;
            let end = (start + size).min(total);
            next = (end < total).then(|| start + self.config.stride());
            Some((start, end))
        })
    }
}

fn cap_chars(text: String, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => text[..idx].to_string(),
        None => text,
    }
}
