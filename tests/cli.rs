// SPDX-License-Identifier: MIT OR Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use assert_cmd::cargo::cargo_bin_cmd;
use codescout::cache::EmbeddedCache;
use serde_json::Value;

fn write_file(path: &Path, contents: &str) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn write_bytes(path: &Path, bytes: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, bytes).unwrap();
}

fn write_dummy_config(repo_root: &Path) {
    fs::write(
        repo_root.join(".codescout.toml"),
        r#"
[embeddings]
provider = "dummy"
dimension = 32

[index]
chunk_lines = 2
chunk_overlap = 0
min_chunk_size = 5
"#,
    )
    .unwrap();
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap()
}

fn run_json(repo_root: &Path, args: &[&str]) -> Value {
    let mut cmd = cargo_bin_cmd!("codescout");
    cmd.env_remove("CODESCOUT_EMBEDDING_PROVIDER")
        .env_remove("CODESCOUT_VECTOR_STORE")
        .arg("--format")
        .arg("json")
        .args(args)
        .arg("--path")
        .arg(repo_root);
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).unwrap()
}

fn chunks_for(repo_root: &Path, file: &Path) -> usize {
    let cache = EmbeddedCache::open(&repo_root.join(".codescout")).unwrap();
    let key = canonical(file).to_string_lossy().to_string();
    cache.all_chunks().iter().filter(|c| c.file == key).count()
}

#[test]
fn index_creates_cache_files() {
    let dir = TempDir::new().unwrap();
    write_dummy_config(dir.path());
    let file_path = dir.path().join("src").join("lib.rs");
    write_file(
        &file_path,
        "aaaaaaaaaaaaaaaaaaaa\nbbbbbbbbbbbbbbbbbbbb\ncccccccccccccccccccc\n",
    );

    let summary = run_json(dir.path(), &["index"]);
    assert_eq!(summary["newFiles"], 1);
    assert_eq!(summary["chunksIndexed"], 2);

    assert!(dir.path().join(".codescout/embeddings.sqlite").exists());
    assert!(dir.path().join(".codescout/file-hashes.json").exists());
    assert_eq!(chunks_for(dir.path(), &file_path), 2);
}

#[test]
fn second_index_skips_up_to_date_files() {
    let dir = TempDir::new().unwrap();
    write_dummy_config(dir.path());
    write_file(
        &dir.path().join("src/lib.rs"),
        "aaaaaaaaaaaaaaaaaaaa\nbbbbbbbbbbbbbbbbbbbb\ncccccccccccccccccccc\n",
    );

    run_json(dir.path(), &["index"]);
    let second = run_json(dir.path(), &["index"]);
    assert_eq!(second["skippedFiles"], 1);
    assert_eq!(second["chunksIndexed"], 0);

    let forced = run_json(dir.path(), &["index", "--force"]);
    assert_eq!(forced["newFiles"], 1);
    assert_eq!(forced["chunksIndexed"], 2);
}

#[test]
fn index_removes_chunks_for_deleted_and_binary_files() {
    let dir = TempDir::new().unwrap();
    write_dummy_config(dir.path());
    let a_path = dir.path().join("src/a.rs");
    let b_path = dir.path().join("src/b.rs");
    write_file(
        &a_path,
        "aaaaaaaaaaaaaaaaaaaa\nbbbbbbbbbbbbbbbbbbbb\ncccccccccccccccccccc\n",
    );
    write_file(
        &b_path,
        "dddddddddddddddddddd\neeeeeeeeeeeeeeeeeeee\nffffffffffffffffffff\n",
    );
    run_json(dir.path(), &["index"]);

    fs::remove_file(&b_path).unwrap();
    write_bytes(&a_path, b"hello\0world");
    let summary = run_json(dir.path(), &["index"]);
    assert_eq!(summary["deletedFiles"], 2);

    let cache = EmbeddedCache::open(&dir.path().join(".codescout")).unwrap();
    assert!(cache.all_chunks().is_empty());
}

#[test]
fn search_status_and_clear_round_trip() {
    let dir = TempDir::new().unwrap();
    write_dummy_config(dir.path());
    write_file(
        &dir.path().join("src/auth.rs"),
        "fn handle_login(user: &str) -> bool {\n    verify_password(user)\n}\n",
    );
    write_file(
        &dir.path().join("src/math.rs"),
        "fn add_numbers(a: i32, b: i32) -> i32 {\n    a + b\n}\n",
    );
    run_json(dir.path(), &["index"]);

    let response = run_json(dir.path(), &["search", "handle_login", "-m", "3"]);
    assert_eq!(response["status"], "ok");
    assert_eq!(response["results"][0]["path"], "src/auth.rs");
    assert!(response["results"].as_array().unwrap().len() <= 3);

    let status = run_json(dir.path(), &["status"]);
    assert_eq!(status["index"]["status"], "ready");
    assert_eq!(status["cache"]["type"], "embedded");
    assert_eq!(status["embedding"]["model"], "dummy");
    assert_eq!(status["embedding"]["dimension"], 32);

    let cleared = run_json(dir.path(), &["clear"]);
    assert_eq!(cleared["success"], true);

    let status = run_json(dir.path(), &["status"]);
    assert_eq!(status["index"]["status"], "empty");
    assert_eq!(status["index"]["chunksCount"], 0);
}

#[test]
fn search_before_indexing_explains_itself() {
    let dir = TempDir::new().unwrap();
    write_dummy_config(dir.path());

    let mut cmd = cargo_bin_cmd!("codescout");
    cmd.arg("search")
        .arg("login")
        .arg("--path")
        .arg(dir.path());
    let output = cmd.assert().success().get_output().stdout.clone();
    let text = String::from_utf8(output).unwrap();
    assert!(text.contains("No code has been indexed yet"));
}
