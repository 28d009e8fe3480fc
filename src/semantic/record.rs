//! Chunk records, the unit of retrieval.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One embedded segment of a source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    /// `<source_file_id>_<chunk_index>`, unique across the cache
    pub chunk_id: String,
    pub text: String,
    pub embedding: Vec<f32>,
    /// Human readable file name
    pub source_document: String,
    /// Stable link to the original file
    pub source_link: String,
    pub chunk_index: usize,
    pub total_chunks: usize,
    /// Drive folder the chunk was indexed under
    pub folder_id: String,
    pub created_at: DateTime<Utc>,
}

/// Derive the primary key of a chunk from its source file and position.
pub fn chunk_id(source_file_id: &str, chunk_index: usize) -> String {
    format!("{source_file_id}_{chunk_index}")
}

/// Shared fields of every chunk cut from one document.
#[derive(Debug, Clone)]
pub struct SourceDocument {
    pub file_id: String,
    pub name: String,
    pub link: String,
    pub folder_id: String,
}

impl SourceDocument {
    /// Zip segments with their embeddings into records.
    ///
    /// Both slices must have the same length; every record carries the same
    /// `total_chunks`, name, link and folder.
    pub fn into_records(
        &self,
        segments: Vec<String>,
        embeddings: Vec<Vec<f32>>,
        created_at: DateTime<Utc>,
    ) -> Vec<ChunkRecord> {
        debug_assert_eq!(segments.len(), embeddings.len());
        let total_chunks = segments.len();

        segments
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(chunk_index, (text, embedding))| ChunkRecord {
                chunk_id: chunk_id(&self.file_id, chunk_index),
                text,
                embedding,
                source_document: self.name.clone(),
                source_link: self.link.clone(),
                chunk_index,
                total_chunks,
                folder_id: self.folder_id.clone(),
                created_at,
            })
            .collect()
    }
}
