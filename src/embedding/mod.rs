// SPDX-License-Identifier: MIT OR Apache-2.0

//! Embedding module - turns source chunks and queries into vectors
//!
//! Providers come in two families: in-process models (`local`) and remote
//! embeddings APIs (`remote`). The chunker splits files into the line
//! windows that get embedded.

pub mod chunker;
pub mod local;
pub mod provider;
pub mod remote;

pub use chunker::{ChunkConfig, EmbeddingChunker, TextChunk};
pub use local::{
    is_corruption_error, mrl_truncate, InferenceModel, LocalEmbedder, LocalModel, LocalOptions,
    ModelLoader,
};
#[cfg(not(all(target_os = "macos", target_arch = "x86_64")))]
pub use local::FastEmbedLoader;
pub use provider::{create_provider, DummyProvider, Embedding, EmbeddingProvider, Venue};
pub use remote::{ApiFlavor, RemoteConfig, RemoteEmbedder};
