// SPDX-License-Identifier: MIT OR Apache-2.0

//! SQLite-backed chunk store with in-process similarity scoring.
//!
//! Every chunk is kept in memory as well as in `embeddings.sqlite`, so
//! search is a brute-force cosine pass over the materialized set.

use parking_lot::{Mutex, RwLock};
use rayon::prelude::*;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use super::hashes::FileHashStore;
use super::{CacheStats, Chunk, ScoredChunk};
use crate::errors::CacheError;

/// Database file name inside the cache directory.
pub const EMBEDDINGS_DB_NAME: &str = "embeddings.sqlite";

const SCHEMA_VERSION: &str = "1";

/// Meta key holding the vector dimension of the stored chunks.
const DIMENSION_KEY: &str = "dimension";

/// Brute-force vector cache.
///
/// The first stored vector fixes the dimension (kept in `meta`); later
/// writes and queries of another length fail with `DimensionMismatch`
/// until the cache is reset.
pub struct EmbeddedCache {
    conn: Mutex<Connection>,
    chunks: RwLock<BTreeMap<String, Vec<Chunk>>>,
    dimension: Mutex<Option<usize>>,
    hashes: FileHashStore,
    directory: PathBuf,
}

impl EmbeddedCache {
    /// Opens or creates the store in `cache_dir` and loads every chunk.
    pub fn open(cache_dir: &Path) -> Result<Self, CacheError> {
        std::fs::create_dir_all(cache_dir)?;
        let conn = Connection::open(cache_dir.join(EMBEDDINGS_DB_NAME))?;
        init_schema(&conn)?;

        let chunks = load_all(&conn)?;
        let dimension = match get_meta(&conn, DIMENSION_KEY)? {
            Some(raw) => raw.parse::<usize>().ok(),
            None => {
                // Stores written before the dimension was recorded.
                let inferred = chunks.values().flatten().next().map(|c| c.vector.len());
                if let Some(dim) = inferred {
                    set_meta(&conn, DIMENSION_KEY, &dim.to_string())?;
                }
                inferred
            }
        };
        let hashes = FileHashStore::load(cache_dir);
        let total: usize = chunks.values().map(Vec::len).sum();
        tracing::info!(
            "Loaded embedded cache: {} chunks from {} files",
            total,
            chunks.len()
        );

        Ok(Self {
            conn: Mutex::new(conn),
            chunks: RwLock::new(chunks),
            dimension: Mutex::new(dimension),
            hashes,
            directory: cache_dir.to_path_buf(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn hashes(&self) -> &FileHashStore {
        &self.hashes
    }

    /// Dimension of the stored vectors, once anything was written.
    pub fn dimension(&self) -> Option<usize> {
        *self.dimension.lock()
    }

    /// Checks `batch` against the stored dimension, recording it on the
    /// first write.
    fn check_dimension(&self, batch: &[Chunk]) -> Result<(), CacheError> {
        let Some(first) = batch.first() else {
            return Ok(());
        };
        let mut dimension = self.dimension.lock();
        let expected = dimension.unwrap_or(first.vector.len());
        if let Some(chunk) = batch.iter().find(|c| c.vector.len() != expected) {
            return Err(CacheError::DimensionMismatch {
                expected,
                actual: chunk.vector.len(),
            });
        }
        if dimension.is_none() {
            set_meta(&self.conn.lock(), DIMENSION_KEY, &expected.to_string())?;
            *dimension = Some(expected);
        }
        Ok(())
    }

    /// Inserts or replaces chunks keyed by (file, start_line, end_line).
    pub fn upsert_batch(&self, batch: Vec<Chunk>) -> Result<(), CacheError> {
        if batch.is_empty() {
            return Ok(());
        }
        self.check_dimension(&batch)?;

        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    r#"
                    INSERT INTO chunks (file, start_line, end_line, content, vector)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    ON CONFLICT(file, start_line, end_line) DO UPDATE SET
                        content = excluded.content,
                        vector = excluded.vector
                    "#,
                )?;
                for chunk in &batch {
                    stmt.execute(params![
                        chunk.file,
                        chunk.start_line,
                        chunk.end_line,
                        chunk.content,
                        vector_to_blob(&chunk.vector)
                    ])?;
                }
            }
            tx.commit()?;
        }

        let mut chunks = self.chunks.write();
        for chunk in batch {
            let entry = chunks.entry(chunk.file.clone()).or_default();
            match entry
                .iter_mut()
                .find(|c| c.start_line == chunk.start_line && c.end_line == chunk.end_line)
            {
                Some(existing) => *existing = chunk,
                None => {
                    entry.push(chunk);
                    entry.sort_by_key(|c| (c.start_line, c.end_line));
                }
            }
        }
        Ok(())
    }

    /// Replaces every chunk of `file` in one transaction.
    pub fn replace_file(&self, file: &str, batch: Vec<Chunk>) -> Result<(), CacheError> {
        self.check_dimension(&batch)?;
        {
            let mut conn = self.conn.lock();
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM chunks WHERE file = ?1", params![file])?;
            {
                let mut stmt = tx.prepare(
                    r#"
                    INSERT OR REPLACE INTO chunks (file, start_line, end_line, content, vector)
                    VALUES (?1, ?2, ?3, ?4, ?5)
                    "#,
                )?;
                for chunk in &batch {
                    stmt.execute(params![
                        file,
                        chunk.start_line,
                        chunk.end_line,
                        chunk.content,
                        vector_to_blob(&chunk.vector)
                    ])?;
                }
            }
            tx.commit()?;
        }

        let mut chunks = self.chunks.write();
        if batch.is_empty() {
            chunks.remove(file);
        } else {
            let mut batch = batch;
            batch.sort_by_key(|c| (c.start_line, c.end_line));
            chunks.insert(file.to_string(), batch);
        }
        Ok(())
    }

    pub fn remove_file(&self, file: &str) -> Result<(), CacheError> {
        self.conn
            .lock()
            .execute("DELETE FROM chunks WHERE file = ?1", params![file])?;
        self.chunks.write().remove(file);
        Ok(())
    }

    /// Every stored chunk, ordered by file then line.
    pub fn all_chunks(&self) -> Vec<Chunk> {
        self.chunks.read().values().flatten().cloned().collect()
    }

    /// Cosine similarity of `query` against every chunk under `prefix`,
    /// in storage order.
    pub fn score_all(
        &self,
        query: &[f32],
        prefix: Option<&str>,
    ) -> Result<Vec<ScoredChunk>, CacheError> {
        if let Some(expected) = self.dimension() {
            if query.len() != expected {
                return Err(CacheError::DimensionMismatch {
                    expected,
                    actual: query.len(),
                });
            }
        }
        let chunks = self.chunks.read();
        let candidates: Vec<&Chunk> = chunks
            .iter()
            .filter(|(file, _)| prefix.map_or(true, |p| file.starts_with(p)))
            .flat_map(|(_, list)| list.iter())
            .collect();

        let scored: Vec<ScoredChunk> = candidates
            .par_iter()
            .map(|chunk| ScoredChunk {
                file: chunk.file.clone(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
                content: chunk.content.clone(),
                score: cosine_similarity(query, &chunk.vector),
            })
            .collect();
        Ok(scored)
    }

    pub fn stats(&self) -> CacheStats {
        let chunks = self.chunks.read();
        CacheStats {
            total_chunks: chunks.values().map(Vec::len).sum::<usize>() as u64,
            total_files: chunks.len(),
        }
    }

    /// Saves file hashes. Chunk writes are committed as they happen.
    pub fn persist(&self) -> Result<(), CacheError> {
        self.hashes.save()
    }

    /// Drops all chunks and file records.
    pub fn reset(&self) -> Result<(), CacheError> {
        {
            let conn = self.conn.lock();
            conn.execute("DELETE FROM chunks", [])?;
            conn.execute("DELETE FROM meta WHERE key = ?1", params![DIMENSION_KEY])?;
        }
        self.chunks.write().clear();
        *self.dimension.lock() = None;
        self.hashes.clear();
        self.hashes.save()
    }
}

fn init_schema(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS chunks (
            file TEXT NOT NULL,
            start_line INTEGER NOT NULL,
            end_line INTEGER NOT NULL,
            content TEXT NOT NULL,
            vector BLOB NOT NULL,
            PRIMARY KEY (file, start_line, end_line)
        );
        "#,
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        params![SCHEMA_VERSION],
    )?;
    Ok(())
}

fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>, CacheError> {
    let value = conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(value)
}

fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<(), CacheError> {
    conn.execute(
        r#"
        INSERT INTO meta (key, value)
        VALUES (?1, ?2)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
        params![key, value],
    )?;
    Ok(())
}

fn load_all(conn: &Connection) -> Result<BTreeMap<String, Vec<Chunk>>, CacheError> {
    let mut stmt = conn.prepare(
        r#"
        SELECT file, start_line, end_line, content, vector
        FROM chunks
        ORDER BY file, start_line, end_line
        "#,
    )?;

    let rows = stmt
        .query_map([], |row| {
            let blob: Vec<u8> = row.get(4)?;
            Ok(Chunk {
                file: row.get(0)?,
                start_line: row.get(1)?,
                end_line: row.get(2)?,
                content: row.get(3)?,
                vector: blob_to_vector(&blob),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    let mut grouped: HashMap<String, Vec<Chunk>> = HashMap::new();
    for chunk in rows {
        grouped.entry(chunk.file.clone()).or_default().push(chunk);
    }
    Ok(grouped.into_iter().collect())
}

/// Converts a vector to a compact little-endian blob.
fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

fn blob_to_vector(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect()
}

/// Computes cosine similarity between two vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot_product: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let magnitude_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let magnitude_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if magnitude_a == 0.0 || magnitude_b == 0.0 {
        return 0.0;
    }

    dot_product / (magnitude_a * magnitude_b)
}
