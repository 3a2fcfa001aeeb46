// SPDX-License-Identifier: MIT OR Apache-2.0

//! File scanner using the ignore crate (same as ripgrep)

use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::mpsc;

use crate::config::{IndexConfig, CACHE_DIR_NAME, CONFIG_FILE_NAME};
use crate::errors::IndexError;

/// Bytes inspected when sniffing for binary content.
const BINARY_SNIFF_BYTES: usize = 8192;

const DEFAULT_EXTENSIONS: &[&str] = &[
    "rs", "ts", "tsx", "js", "jsx", "mjs", "cjs", "py", "go", "java", "c", "cpp", "cc", "h",
    "hpp", "cs", "rb", "php", "swift", "kt", "kts", "scala", "lua", "sh", "sql", "vue", "svelte",
    "css", "html", "md", "txt", "json", "yaml", "yml", "toml",
];

/// File scanner that respects .gitignore
#[derive(Debug, Clone)]
pub struct FileScanner {
    root: PathBuf,
    extensions: Vec<String>,
    exclude_patterns: Vec<String>,
    max_file_size: u64,
    /// Directories never descended into, such as a relocated cache.
    skip_dirs: Vec<PathBuf>,
}

impl FileScanner {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            exclude_patterns: Vec::new(),
            max_file_size: 1024 * 1024,
            skip_dirs: Vec::new(),
        }
    }

    pub fn from_config(root: impl AsRef<Path>, config: &IndexConfig) -> Self {
        let mut scanner = Self::new(root)
            .with_excludes(config.exclude_patterns().to_vec())
            .with_max_file_size(config.max_file_size());
        if let Some(extensions) = &config.extensions {
            scanner = scanner.with_extensions(extensions.clone());
        }
        scanner
    }

    /// Replaces the extension allow-list. Leading dots are ignored.
    pub fn with_extensions(mut self, extensions: Vec<String>) -> Self {
        self.extensions = extensions
            .into_iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        self
    }

    /// Gitignore-style globs that are never indexed.
    pub fn with_excludes(mut self, patterns: Vec<String>) -> Self {
        self.exclude_patterns = patterns;
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_skip_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.skip_dirs.push(dir.as_ref().to_path_buf());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// List indexable files under the root, sorted by path.
    pub fn scan(&self) -> Result<Vec<PathBuf>, IndexError> {
        let mut overrides = OverrideBuilder::new(&self.root);
        for pattern in &self.exclude_patterns {
            let pattern = pattern.trim();
            if pattern.is_empty() {
                continue;
            }
            overrides
                .add(&format!("!{}", pattern))
                .map_err(|e| IndexError::Walk(format!("invalid exclude pattern {}: {}", pattern, e)))?;
        }
        let overrides = overrides
            .build()
            .map_err(|e| IndexError::Walk(e.to_string()))?;

        let (tx, rx) = mpsc::channel();
        let skip_dirs = self.skip_dirs.clone();

        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(true)
            .git_exclude(true)
            .require_git(false)
            .overrides(overrides)
            .filter_entry(move |entry| {
                let reserved = entry
                    .file_name()
                    .to_str()
                    .map(|name| name == CACHE_DIR_NAME || name == CONFIG_FILE_NAME || name == ".git")
                    .unwrap_or(false);
                !reserved && !skip_dirs.iter().any(|dir| entry.path() == dir)
            })
            .build_parallel();

        let extensions = self.extensions.clone();
        let max_file_size = self.max_file_size;

        walker.run(|| {
            let tx = tx.clone();
            let extensions = extensions.clone();

            Box::new(move |entry| {
                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::debug!("Skipping unreadable entry: {}", err);
                        return ignore::WalkState::Continue;
                    }
                };
                if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                    return ignore::WalkState::Continue;
                }

                let path = entry.path();
                let matches_ext = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|ext| extensions.contains(&ext.to_lowercase()))
                    .unwrap_or(false);
                if !matches_ext {
                    return ignore::WalkState::Continue;
                }

                match entry.metadata() {
                    Ok(meta) if meta.len() > max_file_size => {
                        tracing::debug!("Skipping {} ({} bytes)", path.display(), meta.len());
                        return ignore::WalkState::Continue;
                    }
                    Ok(_) => {}
                    Err(_) => return ignore::WalkState::Continue,
                }

                if looks_binary(path) {
                    tracing::debug!("Skipping binary file {}", path.display());
                    return ignore::WalkState::Continue;
                }

                let _ = tx.send(path.to_path_buf());
                ignore::WalkState::Continue
            })
        });

        drop(tx);
        let mut files: Vec<PathBuf> = rx.into_iter().collect();
        files.sort();
        Ok(files)
    }
}

/// A NUL byte in the first few KB marks a file as binary.
fn looks_binary(path: &Path) -> bool {
    let mut buf = [0u8; BINARY_SNIFF_BYTES];
    let read = match File::open(path).and_then(|mut f| f.read(&mut buf)) {
        Ok(n) => n,
        Err(_) => return true,
    };
    buf[..read].contains(&0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn names(files: &[PathBuf], root: &Path) -> Vec<String> {
        files
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect()
    }

    #[test]
    fn scans_source_files_and_skips_cache_dir() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::create_dir_all(root.join(CACHE_DIR_NAME)).unwrap();
        fs::write(root.join("src/lib.rs"), "pub fn a() {}\n").unwrap();
        fs::write(root.join("notes.bin"), "xx").unwrap();
        fs::write(root.join(CONFIG_FILE_NAME), "[search]\n").unwrap();
        fs::write(root.join(CACHE_DIR_NAME).join("x.json"), "{}").unwrap();

        let files = FileScanner::new(root).scan().unwrap();
        assert_eq!(names(&files, root), vec!["src/lib.rs"]);
    }

    #[test]
    fn respects_gitignore_and_excludes() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("vendor")).unwrap();
        fs::create_dir_all(root.join("gen")).unwrap();
        fs::write(root.join(".gitignore"), "vendor/\n").unwrap();
        fs::write(root.join("vendor/dep.js"), "module.exports = 1;\n").unwrap();
        fs::write(root.join("gen/out.ts"), "export const x = 1;\n").unwrap();
        fs::write(root.join("main.ts"), "console.log('hi');\n").unwrap();

        let files = FileScanner::new(root)
            .with_excludes(vec!["gen/**".to_string()])
            .scan()
            .unwrap();
        assert_eq!(names(&files, root), vec!["main.ts"]);
    }

    #[test]
    fn skips_large_and_binary_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("big.txt"), "a".repeat(2048)).unwrap();
        fs::write(root.join("blob.json"), b"{\0\0}").unwrap();
        fs::write(root.join("ok.txt"), "fine").unwrap();

        let files = FileScanner::new(root)
            .with_max_file_size(1024)
            .scan()
            .unwrap();
        assert_eq!(names(&files, root), vec!["ok.txt"]);
    }

    #[test]
    fn relocated_cache_dir_is_skipped() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("build/vectors")).unwrap();
        fs::write(root.join("build/vectors/file-hashes.json"), "{}").unwrap();
        fs::write(root.join("build/report.md"), "# report").unwrap();

        let files = FileScanner::new(root)
            .with_skip_dir(root.join("build/vectors"))
            .scan()
            .unwrap();
        assert_eq!(names(&files, root), vec!["build/report.md"]);
    }

    #[test]
    fn custom_extensions_replace_defaults() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("a.rs"), "fn main() {}").unwrap();
        fs::write(root.join("b.proto"), "syntax = \"proto3\";").unwrap();

        let files = FileScanner::new(root)
            .with_extensions(vec![".proto".to_string()])
            .scan()
            .unwrap();
        assert_eq!(names(&files, root), vec!["b.proto"]);
    }
}
