// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-file content hashes persisted as `file-hashes.json`.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::errors::CacheError;

/// File name of the hash store inside the cache directory.
pub const FILE_HASHES_NAME: &str = "file-hashes.json";

/// Content hash and last-seen modification time of one file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub hash: String,
    /// Modification time in milliseconds since the epoch. Advisory only.
    #[serde(default)]
    pub mtime: Option<f64>,
    /// Some chunks failed to embed; the file is re-embedded next run.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub incomplete: bool,
}

/// Older stores kept a bare hash string per file.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRecord {
    Full(FileRecord),
    Legacy(String),
}

impl From<StoredRecord> for FileRecord {
    fn from(stored: StoredRecord) -> Self {
        match stored {
            StoredRecord::Full(record) => record,
            StoredRecord::Legacy(hash) => FileRecord {
                hash,
                mtime: None,
                incomplete: false,
            },
        }
    }
}

#[derive(Default)]
struct HashState {
    records: HashMap<String, FileRecord>,
    dirty: bool,
    /// Bumped on every mutation.
    generation: u64,
}

impl HashState {
    fn touch(&mut self) {
        self.dirty = true;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// In-memory file hash map with dirty tracking and JSON persistence.
pub struct FileHashStore {
    path: PathBuf,
    state: Mutex<HashState>,
}

impl FileHashStore {
    /// Loads `file-hashes.json` from `cache_dir`.
    ///
    /// A missing or unreadable file yields an empty store.
    pub fn load(cache_dir: &Path) -> Self {
        let path = cache_dir.join(FILE_HASHES_NAME);
        let records = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, StoredRecord>>(&raw) {
                Ok(parsed) => parsed.into_iter().map(|(k, v)| (k, v.into())).collect(),
                Err(err) => {
                    tracing::warn!("Ignoring unreadable {}: {}", path.display(), err);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self {
            path,
            state: Mutex::new(HashState {
                records,
                dirty: false,
                generation: 0,
            }),
        }
    }

    pub fn get_record(&self, file: &str) -> Option<FileRecord> {
        self.state.lock().records.get(file).cloned()
    }

    pub fn set(&self, file: &str, hash: &str, mtime: Option<f64>) {
        self.insert(file, hash, mtime, false);
    }

    /// Records a file whose chunks were only partly stored.
    pub fn set_incomplete(&self, file: &str, hash: &str, mtime: Option<f64>) {
        self.insert(file, hash, mtime, true);
    }

    fn insert(&self, file: &str, hash: &str, mtime: Option<f64>, incomplete: bool) {
        let mut state = self.state.lock();
        state.records.insert(
            file.to_string(),
            FileRecord {
                hash: hash.to_string(),
                mtime,
                incomplete,
            },
        );
        state.touch();
    }

    pub fn delete(&self, file: &str) {
        let mut state = self.state.lock();
        if state.records.remove(file).is_some() {
            state.touch();
        }
    }

    pub fn all(&self) -> HashMap<String, FileRecord> {
        self.state.lock().records.clone()
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.records.clear();
        state.touch();
    }

    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the map to disk if it changed since the last save.
    ///
    /// Mutations that land while the file is being written keep the store
    /// dirty, so the next save picks them up.
    pub fn save(&self) -> Result<(), CacheError> {
        let Some((generation, snapshot)) = self.snapshot() else {
            return Ok(());
        };
        self.write(&snapshot)?;
        self.mark_saved(generation);
        Ok(())
    }

    fn snapshot(&self) -> Option<(u64, BTreeMap<String, FileRecord>)> {
        let state = self.state.lock();
        if !state.dirty {
            return None;
        }
        let records = state
            .records
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Some((state.generation, records))
    }

    fn write(&self, snapshot: &BTreeMap<String, FileRecord>) -> Result<(), CacheError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(snapshot)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn mark_saved(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.generation == generation {
            state.dirty = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn set_get_delete() {
        let dir = tempdir().unwrap();
        let store = FileHashStore::load(dir.path());
        store.set("/w/x.ts", "hash-1", Some(123.0));
        assert_eq!(store.get_record("/w/x.ts").map(|r| r.hash).as_deref(), Some("hash-1"));
        assert_eq!(store.get_record("/w/x.ts").unwrap().mtime, Some(123.0));

        store.delete("/w/x.ts");
        assert!(store.get_record("/w/x.ts").is_none());
    }

    #[test]
    fn save_and_reload_round_trip() {
        let dir = tempdir().unwrap();
        let store = FileHashStore::load(dir.path());
        store.set("/w/a.rs", "aaa", None);
        store.set("/w/b.rs", "bbb", Some(42.0));
        store.save().unwrap();

        let raw = std::fs::read_to_string(dir.path().join(FILE_HASHES_NAME)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["/w/a.rs"]["hash"], "aaa");
        assert!(json["/w/a.rs"]["mtime"].is_null());

        let reloaded = FileHashStore::load(dir.path());
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get_record("/w/b.rs").map(|r| r.hash).as_deref(), Some("bbb"));
    }

    #[test]
    fn corrupt_file_loads_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(FILE_HASHES_NAME), "{not json").unwrap();
        let store = FileHashStore::load(dir.path());
        assert!(store.is_empty());
    }

    #[test]
    fn legacy_string_entries_are_accepted() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join(FILE_HASHES_NAME),
            r#"{"/w/old.js": "abc", "/w/new.js": {"hash": "def", "mtime": 5}}"#,
        )
        .unwrap();
        let store = FileHashStore::load(dir.path());
        assert_eq!(store.get_record("/w/old.js").map(|r| r.hash).as_deref(), Some("abc"));
        assert_eq!(store.get_record("/w/new.js").unwrap().mtime, Some(5.0));
    }

    #[test]
    fn write_racing_a_save_is_kept_dirty() {
        let dir = tempdir().unwrap();
        let store = FileHashStore::load(dir.path());
        store.set("/w/a.rs", "aaa", None);

        let (generation, snapshot) = store.snapshot().unwrap();
        store.set("/w/late.rs", "late", None);
        store.write(&snapshot).unwrap();
        store.mark_saved(generation);

        // The first write missed /w/late.rs; the next save must not skip it.
        store.save().unwrap();
        let reloaded = FileHashStore::load(dir.path());
        assert_eq!(reloaded.get_record("/w/late.rs").map(|r| r.hash).as_deref(), Some("late"));
        assert_eq!(reloaded.len(), 2);

        // Nothing changed since: the store is clean again.
        assert!(store.snapshot().is_none());
    }

    #[test]
    fn incomplete_marker_round_trips() {
        let dir = tempdir().unwrap();
        let store = FileHashStore::load(dir.path());
        store.set_incomplete("/w/part.rs", "ppp", Some(7.0));
        store.set("/w/full.rs", "fff", None);
        store.save().unwrap();

        let raw = std::fs::read_to_string(dir.path().join(FILE_HASHES_NAME)).unwrap();
        let json: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(json["/w/part.rs"]["incomplete"], true);
        assert!(json["/w/full.rs"].get("incomplete").is_none());

        let reloaded = FileHashStore::load(dir.path());
        assert!(reloaded.get_record("/w/part.rs").unwrap().incomplete);
        assert!(!reloaded.get_record("/w/full.rs").unwrap().incomplete);
    }

    #[test]
    fn clean_store_is_not_written() {
        let dir = tempdir().unwrap();
        let store = FileHashStore::load(dir.path());
        store.save().unwrap();
        assert!(!dir.path().join(FILE_HASHES_NAME).exists());
    }
}
