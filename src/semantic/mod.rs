//! Chunk cache and semantic retrieval.
//!
//! # Architecture
//!
//! - `chunker`: splits document text into overlapping segments
//! - `embeddings`: embedding client adapter and providers
//! - `store`: durable chunk storage (file or PostgreSQL)
//! - `cache`: in-memory generations of chunk records
//! - `search`: cosine ranking, lexical fallback, result formatting
//! - `manager`: cold start, rebuild, clear and status

pub mod cache;
pub mod chunker;
pub mod embeddings;
#[cfg(feature = "local-embeddings")]
pub mod local_model;
pub mod manager;
pub mod preprocess;
pub mod record;
pub mod search;
pub mod store;

pub use embeddings::{EmbeddingClient, EmbeddingError, OpenAiEmbedder};
pub use manager::{
    CacheManager, CacheStatus, RebuildError, RebuildKind, RebuildReport, RebuildSettings,
};
pub use search::{SearchResponse, SearchStatus};
pub use store::{ChunkStore, FileChunkStore, PgChunkStore};

/// Default embedding model for the OpenAI provider
pub const DEFAULT_MODEL: &str = "text-embedding-3-small";
