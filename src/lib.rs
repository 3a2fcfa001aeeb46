// SPDX-License-Identifier: MIT OR Apache-2.0

//! codescout - Local-first semantic code search library
//!
//! Indexes a workspace into a vector cache (embedded SQLite or Milvus)
//! and serves hybrid semantic/lexical search over it.

pub mod cache;
pub mod config;
pub mod embedding;
pub mod engine;
pub mod errors;
pub mod hybrid;
pub mod indexer;
pub mod output;
pub mod throttle;

pub use engine::{CodeSearch, StatusReport};
