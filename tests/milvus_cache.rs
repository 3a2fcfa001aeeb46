// SPDX-License-Identifier: MIT OR Apache-2.0

use httpmock::prelude::*;
use serde_json::json;
use tempfile::TempDir;

use codescout::cache::{Chunk, MilvusCache, MilvusConfig, VectorCache};
use codescout::errors::CacheError;

fn cache(server: &MockServer, dir: &TempDir, dimension: usize) -> MilvusCache {
    MilvusCache::new(MilvusConfig::new(&server.base_url(), dimension), dir.path()).unwrap()
}

#[tokio::test]
async fn wrong_query_dimension_issues_no_request() {
    let server = MockServer::start_async().await;
    let any = server
        .mock_async(|when, then| {
            when.method(POST).path_contains("/v2/vectordb/");
            then.status(200).json_body(json!({ "code": 0, "data": [] }));
        })
        .await;
    let dir = TempDir::new().unwrap();
    let milvus = cache(&server, &dir, 4);

    let err = milvus
        .search_by_vector(&[0.1, 0.2, 0.3], 10, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CacheError::DimensionMismatch {
            expected: 4,
            actual: 3
        }
    ));
    any.assert_hits_async(0).await;
}

#[tokio::test]
async fn ensure_collection_creates_missing_collection() {
    let server = MockServer::start_async().await;
    let has = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/vectordb/collections/has")
                .json_body_partial(r#"{"collectionName":"codescout_embeddings"}"#);
            then.status(200)
                .json_body(json!({ "code": 0, "data": { "has": false } }));
        })
        .await;
    let create = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/vectordb/collections/create")
                .body_contains("\"FloatVector\"")
                .body_contains("\"COSINE\"");
            then.status(200).json_body(json!({ "code": 0, "data": {} }));
        })
        .await;
    let load = server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/vectordb/collections/load");
            then.status(200).json_body(json!({ "code": 0, "data": {} }));
        })
        .await;

    let dir = TempDir::new().unwrap();
    cache(&server, &dir, 8).ensure_collection().await.unwrap();

    has.assert_hits_async(1).await;
    create.assert_hits_async(1).await;
    load.assert_hits_async(1).await;
}

#[tokio::test]
async fn search_sends_ann_request_with_scope_filter() {
    let server = MockServer::start_async().await;
    let search = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/vectordb/entities/search")
                .json_body_partial(
                    r#"{
                        "collectionName": "codescout_embeddings",
                        "annsField": "vector",
                        "limit": 20,
                        "filter": "file like '/ws/src%'"
                    }"#,
                );
            then.status(200).json_body(json!({
                "code": 0,
                "data": [
                    {
                        "file": "/ws/src/auth.rs",
                        "start_line": 10,
                        "end_line": 34,
                        "content": "fn login() {}",
                        "distance": 0.91
                    }
                ]
            }));
        })
        .await;

    let dir = TempDir::new().unwrap();
    let milvus = cache(&server, &dir, 2);
    let hits = milvus
        .search_by_vector(&[0.6, 0.8], 20, Some("file like '/ws/src%'"))
        .await
        .unwrap();

    search.assert_hits_async(1).await;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].file, "/ws/src/auth.rs");
    assert_eq!(hits[0].start_line, 10);
    assert_eq!(hits[0].end_line, 34);
    assert!((hits[0].score - 0.91).abs() < 1e-6);
}

#[tokio::test]
async fn stats_fall_back_to_collection_row_count() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/vectordb/entities/query");
            then.status(200)
                .json_body(json!({ "code": 0, "data": [{ "count(*)": 0 }] }));
        })
        .await;
    let stats = server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/vectordb/collections/get_stats");
            then.status(200)
                .json_body(json!({ "code": 0, "data": { "rowCount": "7" } }));
        })
        .await;

    let dir = TempDir::new().unwrap();
    let milvus = cache(&server, &dir, 2);
    let result = milvus.stats().await.unwrap();

    assert_eq!(result.total_chunks, 7);
    assert_eq!(result.total_files, 0);
    stats.assert_hits_async(1).await;
}

#[tokio::test]
async fn replace_file_deletes_then_upserts_in_order() {
    let server = MockServer::start_async().await;
    let delete = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/vectordb/entities/delete")
                .json_body_partial(r#"{"filter":"file == \"/ws/a.rs\""}"#);
            then.status(200).json_body(json!({ "code": 0, "data": {} }));
        })
        .await;
    let upsert = server
        .mock_async(|when, then| {
            when.method(POST)
                .path("/v2/vectordb/entities/upsert")
                .body_contains("\"/ws/a.rs\"");
            then.status(200).json_body(json!({ "code": 0, "data": {} }));
        })
        .await;
    let flush = server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/vectordb/collections/flush");
            then.status(200).json_body(json!({ "code": 0, "data": {} }));
        })
        .await;

    let dir = TempDir::new().unwrap();
    let cache = VectorCache::Delegated(cache(&server, &dir, 2));
    cache
        .replace_file(
            "/ws/a.rs",
            vec![Chunk {
                file: "/ws/a.rs".to_string(),
                start_line: 1,
                end_line: 25,
                content: "fn a() {}".to_string(),
                vector: vec![0.6, 0.8],
            }],
        )
        .await
        .unwrap();
    cache.set_file_hash("/ws/a.rs", "abc", None);
    cache.persist().await.unwrap();

    delete.assert_hits_async(1).await;
    upsert.assert_hits_async(1).await;
    flush.assert_hits_async(1).await;
    assert!(dir.path().join("file-hashes.json").exists());
}

#[tokio::test]
async fn failed_writes_surface_on_persist() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(POST).path("/v2/vectordb/entities/delete");
            then.status(200)
                .json_body(json!({ "code": 1100, "message": "collection not loaded" }));
        })
        .await;

    let dir = TempDir::new().unwrap();
    let milvus = cache(&server, &dir, 2);
    milvus.remove_file("/ws/gone.rs").unwrap();

    let err = milvus.wait_for_writes().await.unwrap_err();
    assert!(err.to_string().contains("collection not loaded"));
    // The error is reported once.
    milvus.wait_for_writes().await.unwrap();
}
