// SPDX-License-Identifier: MIT OR Apache-2.0

//! Delegated ANN cache backed by a Milvus server (RESTful API v2).
//!
//! Chunks are never materialized locally. Writes go through one ordered
//! queue per cache instance; `persist` drains it and reports the last write
//! failure. Reads go straight to the server.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use super::hashes::FileHashStore;
use super::{CacheStats, Chunk, ScoredChunk};
use crate::embedding::chunker::MAX_CHUNK_CHARS;
use crate::errors::CacheError;

/// Default collection name.
pub const DEFAULT_COLLECTION: &str = "codescout_embeddings";

const MAX_FILE_PATH_LEN: usize = 4096;
const OUTPUT_FIELDS: [&str; 4] = ["file", "start_line", "end_line", "content"];

/// Connection settings for [`MilvusCache`].
#[derive(Debug, Clone)]
pub struct MilvusConfig {
    /// Server address, e.g. `http://127.0.0.1:19530`
    pub address: String,
    pub token: Option<String>,
    pub database: Option<String>,
    pub collection: String,
    /// Vector dimension, fixed for the lifetime of the cache
    pub dimension: usize,
    pub timeout: Duration,
}

impl MilvusConfig {
    pub fn new(address: &str, dimension: usize) -> Self {
        Self {
            address: address.trim().trim_end_matches('/').to_string(),
            token: None,
            database: None,
            collection: DEFAULT_COLLECTION.to_string(),
            dimension,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Escapes a value for use inside a quoted Milvus filter literal.
pub fn escape_filter_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\'', "\\'")
}

/// Filter matching every file under `prefix`.
pub fn scope_filter(prefix: &str) -> String {
    format!("file like '{}%'", escape_filter_value(prefix))
}

/// Filter matching exactly `file`.
pub fn file_filter(file: &str) -> String {
    format!("file == \"{}\"", escape_filter_value(file))
}

/// Stable primary key for a chunk.
fn chunk_id(file: &str, start_line: u32, end_line: u32) -> String {
    blake3::hash(format!("{}:{}:{}", file, start_line, end_line).as_bytes())
        .to_hex()
        .to_string()
}

/// Thin client for the Milvus RESTful API.
#[derive(Clone)]
struct MilvusClient {
    http: reqwest::Client,
    config: Arc<MilvusConfig>,
}

impl MilvusClient {
    async fn call(&self, endpoint: &str, mut body: Value) -> Result<Value, CacheError> {
        if let (Some(db), Some(map)) = (self.config.database.as_deref(), body.as_object_mut()) {
            map.insert("dbName".to_string(), json!(db));
        }

        let url = format!("{}/v2/vectordb/{}", self.config.address, endpoint);
        let mut request = self.http.post(&url).json(&body);
        if let Some(token) = self.config.token.as_deref().filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(CacheError::Remote(format!(
                "{} returned HTTP {}: {}",
                endpoint,
                status.as_u16(),
                text.trim()
            )));
        }

        let payload: Value = response.json().await?;
        let code = payload.get("code").and_then(Value::as_i64).unwrap_or(0);
        if code != 0 {
            let message = payload
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(CacheError::Remote(format!(
                "{} failed (code {}): {}",
                endpoint, code, message
            )));
        }
        Ok(payload)
    }

    fn collection(&self) -> &str {
        &self.config.collection
    }

    async fn upsert(&self, rows: Vec<Value>) -> Result<(), CacheError> {
        if rows.is_empty() {
            return Ok(());
        }
        self.call(
            "entities/upsert",
            json!({ "collectionName": self.collection(), "data": rows }),
        )
        .await
        .map(|_| ())
    }

    async fn delete(&self, filter: &str) -> Result<(), CacheError> {
        self.call(
            "entities/delete",
            json!({ "collectionName": self.collection(), "filter": filter }),
        )
        .await
        .map(|_| ())
    }
}

enum WriteOp {
    Upsert(Vec<Value>),
    ReplaceFile { filter: String, rows: Vec<Value> },
    Delete(String),
    Drain(oneshot::Sender<Option<String>>),
}

async fn write_loop(client: MilvusClient, mut ops: mpsc::UnboundedReceiver<WriteOp>) {
    let mut last_error: Option<String> = None;
    while let Some(op) = ops.recv().await {
        let (label, result) = match op {
            WriteOp::Upsert(rows) => ("upsert", client.upsert(rows).await),
            WriteOp::ReplaceFile { filter, rows } => {
                let result = match client.delete(&filter).await {
                    Ok(()) => client.upsert(rows).await,
                    Err(err) => Err(err),
                };
                ("replace", result)
            }
            WriteOp::Delete(filter) => ("delete", client.delete(&filter).await),
            WriteOp::Drain(reply) => {
                let _ = reply.send(last_error.take());
                continue;
            }
        };
        if let Err(err) = result {
            tracing::error!("Milvus {} failed: {}", label, err);
            last_error = Some(err.to_string());
        }
    }
}

/// Vector cache that delegates storage and nearest-neighbour search to Milvus.
pub struct MilvusCache {
    client: MilvusClient,
    writes: mpsc::UnboundedSender<WriteOp>,
    hashes: FileHashStore,
    directory: PathBuf,
}

impl MilvusCache {
    /// Creates the cache and starts its write queue. No request is sent
    /// until [`MilvusCache::ensure_collection`].
    pub fn new(config: MilvusConfig, cache_dir: &Path) -> Result<Self, CacheError> {
        if config.address.trim().is_empty() {
            return Err(CacheError::Config(
                "Milvus vector store selected but CODESCOUT_MILVUS_ADDRESS is not set".to_string(),
            ));
        }
        if config.dimension == 0 {
            return Err(CacheError::Config(
                "Milvus vector dimension must be positive".to_string(),
            ));
        }

        std::fs::create_dir_all(cache_dir)?;
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        let client = MilvusClient {
            http,
            config: Arc::new(config),
        };

        let (writes, ops) = mpsc::unbounded_channel();
        tokio::spawn(write_loop(client.clone(), ops));

        Ok(Self {
            client,
            writes,
            hashes: FileHashStore::load(cache_dir),
            directory: cache_dir.to_path_buf(),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn hashes(&self) -> &FileHashStore {
        &self.hashes
    }

    pub fn dimension(&self) -> usize {
        self.client.config.dimension
    }

    pub fn collection(&self) -> &str {
        self.client.collection()
    }

    /// Creates the collection with the canonical schema if absent, then loads it.
    pub async fn ensure_collection(&self) -> Result<(), CacheError> {
        let has = self
            .client
            .call(
                "collections/has",
                json!({ "collectionName": self.collection() }),
            )
            .await?;
        let exists = has
            .pointer("/data/has")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if !exists {
            tracing::info!(
                "Creating Milvus collection {} (dim {})",
                self.collection(),
                self.dimension()
            );
            self.client
                .call("collections/create", self.create_collection_body())
                .await?;
        }

        self.client
            .call(
                "collections/load",
                json!({ "collectionName": self.collection() }),
            )
            .await?;
        Ok(())
    }

    fn create_collection_body(&self) -> Value {
        json!({
            "collectionName": self.collection(),
            "schema": {
                "autoId": false,
                "enableDynamicField": false,
                "fields": [
                    {
                        "fieldName": "id",
                        "dataType": "VarChar",
                        "isPrimary": true,
                        "elementTypeParams": { "max_length": "64" }
                    },
                    {
                        "fieldName": "file",
                        "dataType": "VarChar",
                        "elementTypeParams": { "max_length": MAX_FILE_PATH_LEN.to_string() }
                    },
                    { "fieldName": "start_line", "dataType": "Int64" },
                    { "fieldName": "end_line", "dataType": "Int64" },
                    {
                        "fieldName": "content",
                        "dataType": "VarChar",
                        "elementTypeParams": { "max_length": MAX_CHUNK_CHARS.to_string() }
                    },
                    {
                        "fieldName": "vector",
                        "dataType": "FloatVector",
                        "elementTypeParams": { "dim": self.dimension().to_string() }
                    }
                ]
            },
            "indexParams": [
                {
                    "fieldName": "vector",
                    "indexName": "vector",
                    "metricType": "COSINE",
                    "indexType": "AUTOINDEX"
                }
            ]
        })
    }

    fn check_dimension(&self, actual: usize) -> Result<(), CacheError> {
        let expected = self.dimension();
        if actual != expected {
            return Err(CacheError::DimensionMismatch { expected, actual });
        }
        Ok(())
    }

    fn to_rows(&self, chunks: &[Chunk]) -> Result<Vec<Value>, CacheError> {
        for chunk in chunks {
            self.check_dimension(chunk.vector.len())?;
        }
        Ok(chunks
            .iter()
            .map(|chunk| {
                let content: String = chunk.content.chars().take(MAX_CHUNK_CHARS).collect();
                json!({
                    "id": chunk_id(&chunk.file, chunk.start_line, chunk.end_line),
                    "file": chunk.file,
                    "start_line": chunk.start_line,
                    "end_line": chunk.end_line,
                    "content": content,
                    "vector": chunk.vector,
                })
            })
            .collect())
    }

    fn enqueue(&self, op: WriteOp) -> Result<(), CacheError> {
        self.writes
            .send(op)
            .map_err(|_| CacheError::Remote("Milvus write queue has stopped".to_string()))
    }

    /// Queues an upsert. Fails immediately on a dimension mismatch.
    pub fn upsert_batch(&self, chunks: Vec<Chunk>) -> Result<(), CacheError> {
        let rows = self.to_rows(&chunks)?;
        if rows.is_empty() {
            return Ok(());
        }
        self.enqueue(WriteOp::Upsert(rows))
    }

    /// Queues a delete of `file` followed by an insert of `chunks`.
    pub fn replace_file(&self, file: &str, chunks: Vec<Chunk>) -> Result<(), CacheError> {
        let rows = self.to_rows(&chunks)?;
        self.enqueue(WriteOp::ReplaceFile {
            filter: file_filter(file),
            rows,
        })
    }

    pub fn remove_file(&self, file: &str) -> Result<(), CacheError> {
        self.enqueue(WriteOp::Delete(file_filter(file)))
    }

    /// Nearest neighbours of `query` by cosine similarity.
    pub async fn search_by_vector(
        &self,
        query: &[f32],
        top_k: usize,
        filter: Option<&str>,
    ) -> Result<Vec<ScoredChunk>, CacheError> {
        self.check_dimension(query.len())?;

        let mut body = json!({
            "collectionName": self.collection(),
            "data": [query],
            "annsField": "vector",
            "limit": top_k.max(1),
            "outputFields": OUTPUT_FIELDS,
            "searchParams": { "metricType": "COSINE" },
        });
        if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
            body["filter"] = json!(filter);
        }

        let payload = self.client.call("entities/search", body).await?;
        let rows = payload
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        Ok(rows
            .iter()
            .filter_map(|row| {
                let file = row.get("file")?.as_str()?.to_string();
                Some(ScoredChunk {
                    file,
                    start_line: int_field(row, "start_line"),
                    end_line: int_field(row, "end_line"),
                    content: row
                        .get("content")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                    score: row
                        .get("distance")
                        .or_else(|| row.get("score"))
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0) as f32,
                })
            })
            .collect())
    }

    /// Chunk count from a `count(*)` query, falling back to collection
    /// statistics when the query fails or reports zero.
    pub async fn stats(&self) -> Result<CacheStats, CacheError> {
        let counted = match self
            .client
            .call(
                "entities/query",
                json!({
                    "collectionName": self.collection(),
                    "filter": "",
                    "outputFields": ["count(*)"],
                }),
            )
            .await
        {
            Ok(payload) => payload
                .pointer("/data/0/count(*)")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            Err(err) => {
                tracing::debug!("Milvus count query failed, using collection stats: {}", err);
                0
            }
        };

        let total_chunks = if counted > 0 {
            counted
        } else {
            let stats = self
                .client
                .call(
                    "collections/get_stats",
                    json!({ "collectionName": self.collection() }),
                )
                .await?;
            stats
                .pointer("/data/rowCount")
                .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
                .unwrap_or(0)
        };

        Ok(CacheStats {
            total_chunks,
            total_files: self.hashes.len(),
        })
    }

    /// Waits for queued writes; returns the last write failure, if any.
    pub async fn wait_for_writes(&self) -> Result<(), CacheError> {
        let (reply, done) = oneshot::channel();
        self.enqueue(WriteOp::Drain(reply))?;
        match done.await {
            Ok(None) => Ok(()),
            Ok(Some(message)) => Err(CacheError::Remote(message)),
            Err(_) => Err(CacheError::Remote(
                "Milvus write queue has stopped".to_string(),
            )),
        }
    }

    /// Drains writes, flushes the collection and saves file hashes.
    pub async fn persist(&self) -> Result<(), CacheError> {
        self.wait_for_writes().await?;
        if let Err(err) = self
            .client
            .call(
                "collections/flush",
                json!({ "collectionName": self.collection() }),
            )
            .await
        {
            tracing::warn!("Milvus flush warning: {}", err);
        }
        self.hashes.save()
    }

    /// Deletes every row and all file records.
    pub async fn reset(&self) -> Result<(), CacheError> {
        self.enqueue(WriteOp::Delete("id != \"\"".to_string()))?;
        self.hashes.clear();
        self.persist().await
    }

    /// Drops and recreates the collection, then clears file records.
    pub async fn clear(&self) -> Result<(), CacheError> {
        self.wait_for_writes().await?;

        if let Err(err) = self
            .client
            .call(
                "collections/drop",
                json!({ "collectionName": self.collection() }),
            )
            .await
        {
            tracing::warn!("Milvus drop collection warning: {}", err);
        }
        self.ensure_collection().await?;

        self.hashes.clear();
        self.hashes.save()?;
        tracing::info!("Milvus cache cleared: {}", self.collection());
        Ok(())
    }
}

fn int_field(row: &Value, name: &str) -> u32 {
    row.get(name)
        .and_then(|v| v.as_u64().or_else(|| v.as_str()?.parse().ok()))
        .unwrap_or(0) as u32
}
