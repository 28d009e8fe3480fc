//! Durable chunk storage.
//!
//! The whole store represents one indexed folder. `replace_all` swaps the full
//! record set in one step so a concurrent `load_all` sees either the previous
//! set or the new one, never a half-cleared store.

mod file;
mod postgres;

pub use file::FileChunkStore;
pub use postgres::PgChunkStore;

use crate::semantic::record::ChunkRecord;

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("chunk store unavailable: {0}")]
    Unavailable(String),

    #[error("stored chunks were embedded with a different model")]
    ModelMismatch,

    #[error("chunk store is corrupted: {0}")]
    Corrupted(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Durable tier of the chunk cache.
pub trait ChunkStore: Send + Sync {
    /// Short backend name for status reporting.
    fn kind(&self) -> &'static str;

    /// All stored records, in insertion order. An empty store is not an error.
    fn load_all(&self) -> Result<Vec<ChunkRecord>, StoreError>;

    /// Atomically replace every stored record with `records`.
    fn replace_all(&self, records: &[ChunkRecord]) -> Result<(), StoreError>;

    fn count(&self) -> Result<usize, StoreError>;

    fn clear(&self) -> Result<(), StoreError>;
}

/// SHA256 of the embedding model name, used to tag stored generations.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}
