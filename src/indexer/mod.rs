// SPDX-License-Identifier: MIT OR Apache-2.0

//! Indexer module - scans the workspace and keeps the vector cache current

pub mod index;
pub mod scanner;
pub mod status;

pub use index::{ClearOutcome, IndexOutcome, IndexSummary, Indexer, StartOutcome};
pub use scanner::FileScanner;
pub use status::IndexingStatus;
