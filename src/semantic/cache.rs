//! In-memory chunk cache.
//!
//! Each published generation is an immutable snapshot behind an `Arc`.
//! Readers clone the `Arc` and keep working on that generation even if a new
//! one is swapped in meanwhile, so a search never sees records of two
//! generations. There is no time-based eviction; contents change only through
//! `replace` and `clear`.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use crate::semantic::record::ChunkRecord;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CacheError {
    #[error("duplicate chunk id: {0}")]
    DuplicateChunkId(String),

    #[error("chunk {chunk_id} has {got} dimensions, expected {expected}")]
    DimensionMismatch {
        chunk_id: String,
        expected: usize,
        got: usize,
    },
}

/// One published set of records.
#[derive(Debug)]
pub struct Generation {
    number: u64,
    records: Vec<ChunkRecord>,
    populated_at: Option<DateTime<Utc>>,
    dimensions: usize,
}

impl Generation {
    fn empty(number: u64) -> Self {
        Self {
            number,
            records: Vec::new(),
            populated_at: None,
            dimensions: 0,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    /// Records in insertion order.
    pub fn records(&self) -> &[ChunkRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn populated_at(&self) -> Option<DateTime<Utc>> {
        self.populated_at
    }

    /// Embedding length shared by every record; 0 when empty.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Number of distinct source documents.
    pub fn document_count(&self) -> usize {
        self.records
            .iter()
            .map(|r| r.source_link.as_str())
            .collect::<HashSet<_>>()
            .len()
    }
}

/// Hot copy of every chunk record.
pub struct ChunkCache {
    current: RwLock<Arc<Generation>>,
    counter: AtomicU64,
}

impl Default for ChunkCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Generation::empty(0))),
            counter: AtomicU64::new(0),
        }
    }

    /// The currently published generation.
    pub fn snapshot(&self) -> Arc<Generation> {
        match self.current.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    pub fn is_ready(&self) -> bool {
        !self.snapshot().is_empty()
    }

    pub fn size(&self) -> usize {
        self.snapshot().len()
    }

    pub fn generation(&self) -> u64 {
        self.snapshot().number()
    }

    /// Check that ids are unique and every embedding has the same length.
    ///
    /// Returns the shared embedding length, 0 for an empty set.
    pub fn validate(records: &[ChunkRecord]) -> Result<usize, CacheError> {
        let dimensions = records.first().map(|r| r.embedding.len()).unwrap_or(0);

        let mut seen = HashSet::with_capacity(records.len());
        for record in records {
            if record.embedding.len() != dimensions {
                return Err(CacheError::DimensionMismatch {
                    chunk_id: record.chunk_id.clone(),
                    expected: dimensions,
                    got: record.embedding.len(),
                });
            }
            if !seen.insert(record.chunk_id.as_str()) {
                return Err(CacheError::DuplicateChunkId(record.chunk_id.clone()));
            }
        }
        Ok(dimensions)
    }

    /// Validate `records` and publish them as a new generation.
    ///
    /// On error the current generation stays in place and the counter does
    /// not move. Returns the new generation number.
    pub fn replace(&self, records: Vec<ChunkRecord>) -> Result<u64, CacheError> {
        let dimensions = Self::validate(&records)?;

        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let number = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        *current = Arc::new(Generation {
            number,
            records,
            populated_at: Some(Utc::now()),
            dimensions,
        });

        Ok(number)
    }

    /// Drop every record. The generation counter keeps counting from where it was.
    pub fn clear(&self) {
        let mut current = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let number = current.number;
        *current = Arc::new(Generation::empty(number));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            chunk_id: id.to_string(),
            text: format!("text of {id}"),
            embedding,
            source_document: format!("{id}.docx"),
            source_link: format!("https://example.com/{id}"),
            chunk_index: 0,
            total_chunks: 1,
            folder_id: "folder".to_string(),
            created_at: Utc::now(),
        }
    }

    fn ids(generation: &Generation) -> Vec<&str> {
        generation.records().iter().map(|r| r.chunk_id.as_str()).collect()
    }

    #[test]
    fn test_new_cache_is_empty() {
        let cache = ChunkCache::new();
        assert!(!cache.is_ready());
        assert_eq!(cache.size(), 0);
        assert_eq!(cache.generation(), 0);
        assert!(cache.snapshot().populated_at().is_none());
    }

    #[test]
    fn test_replace_publishes_generation() {
        let cache = ChunkCache::new();
        let generation = cache
            .replace(vec![record("a", vec![1.0, 0.0]), record("b", vec![0.0, 1.0])])
            .unwrap();

        assert_eq!(generation, 1);
        assert!(cache.is_ready());
        assert_eq!(cache.size(), 2);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.dimensions(), 2);
        assert_eq!(snapshot.records()[1].text, "text of b");
        assert!(snapshot.populated_at().is_some());
        assert_eq!(ids(&snapshot), vec!["a", "b"]);
    }

    #[test]
    fn test_duplicate_ids_rejected_and_previous_kept() {
        let cache = ChunkCache::new();
        cache.replace(vec![record("a", vec![1.0])]).unwrap();

        let err = cache
            .replace(vec![record("x", vec![1.0]), record("x", vec![2.0])])
            .unwrap_err();
        assert_eq!(err, CacheError::DuplicateChunkId("x".to_string()));

        assert_eq!(cache.generation(), 1);
        assert_eq!(ids(&cache.snapshot()), vec!["a"]);
    }

    #[test]
    fn test_mixed_dimensions_rejected() {
        let cache = ChunkCache::new();
        let err = cache
            .replace(vec![record("a", vec![1.0, 0.0]), record("b", vec![1.0])])
            .unwrap_err();
        assert!(matches!(err, CacheError::DimensionMismatch { expected: 2, got: 1, .. }));
        assert!(!cache.is_ready());
    }

    #[test]
    fn test_old_snapshot_survives_swap() {
        let cache = ChunkCache::new();
        cache.replace(vec![record("old", vec![1.0])]).unwrap();

        let before = cache.snapshot();
        cache.replace(vec![record("new", vec![1.0])]).unwrap();

        assert_eq!(before.number(), 1);
        assert_eq!(ids(&before), vec!["old"]);
        assert_eq!(ids(&cache.snapshot()), vec!["new"]);
        assert_eq!(cache.generation(), 2);
    }

    #[test]
    fn test_clear_keeps_counter_monotonic() {
        let cache = ChunkCache::new();
        cache.replace(vec![record("a", vec![1.0])]).unwrap();
        cache.clear();

        assert!(!cache.is_ready());
        assert_eq!(cache.generation(), 1);

        let next = cache.replace(vec![record("b", vec![1.0])]).unwrap();
        assert_eq!(next, 2);
    }

    #[test]
    fn test_document_count() {
        let cache = ChunkCache::new();
        let mut second = record("a2", vec![1.0]);
        second.source_link = "https://example.com/a".to_string();
        let mut first = record("a1", vec![1.0]);
        first.source_link = "https://example.com/a".to_string();

        cache
            .replace(vec![first, second, record("b", vec![1.0])])
            .unwrap();
        assert_eq!(cache.snapshot().document_count(), 2);
    }
}
