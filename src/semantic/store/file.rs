//! Binary file storage for chunk records.
//!
//! File format: chunks.bin
//!
//! Header (53 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u32 (little-endian)
//! - entry_count: u64 (little-endian)
//! - body_checksum: u32 (CRC32 of all entry bytes)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Entries (repeated):
//! - chunk_id, text, source_document, source_link, folder_id: u32 length + UTF-8 bytes
//! - chunk_index: u32, total_chunks: u32
//! - created_at: i64 seconds + u32 nanoseconds
//! - embedding: [f32; dimensions]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use super::{model_id_hash, ChunkStore, StoreError};
use crate::semantic::record::ChunkRecord;

/// Current file format version
const FORMAT_VERSION: u8 = 1;

const HEADER_SIZE: usize = 53;

/// Chunk store backed by a single file, replaced atomically on every write.
pub struct FileChunkStore {
    path: PathBuf,
    model_id: [u8; 32],
}

impl FileChunkStore {
    pub fn new(path: PathBuf, model_name: &str) -> Self {
        Self {
            path,
            model_id: model_id_hash(model_name),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Uses atomic write: temp file -> fsync -> rename
    fn save(&self, records: &[ChunkRecord]) -> Result<(), StoreError> {
        let temp_path = self.path.with_extension("tmp");
        let result = self.write_to_file(&temp_path, records);
        if result.is_err() {
            let _ = std::fs::remove_file(&temp_path);
            return result;
        }

        std::fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn write_to_file(&self, path: &Path, records: &[ChunkRecord]) -> Result<(), StoreError> {
        let dimensions = records.first().map(|r| r.embedding.len()).unwrap_or(0);

        let mut body = Vec::new();
        for record in records {
            if record.embedding.len() != dimensions {
                return Err(StoreError::Corrupted(format!(
                    "chunk {} has {} dimensions, expected {}",
                    record.chunk_id,
                    record.embedding.len(),
                    dimensions
                )));
            }
            encode_entry(&mut body, record)?;
        }

        let mut header = [0u8; HEADER_SIZE];
        header[0] = FORMAT_VERSION;
        header[1..33].copy_from_slice(&self.model_id);
        header[33..37].copy_from_slice(&to_u32(dimensions, "dimensions")?.to_le_bytes());
        header[37..45].copy_from_slice(&(records.len() as u64).to_le_bytes());
        header[45..49].copy_from_slice(&crc32fast::hash(&body).to_le_bytes());
        let checksum = crc32fast::hash(&header[0..49]);
        header[49..53].copy_from_slice(&checksum.to_le_bytes());

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&header)?;
        writer.write_all(&body)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        Ok(())
    }

    /// Read and validate the header; `None` when no file exists yet.
    fn read(&self) -> Result<Option<(Header, Vec<u8>)>, StoreError> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        if bytes.len() < HEADER_SIZE {
            return Err(StoreError::Corrupted("file shorter than header".to_string()));
        }

        let version = bytes[0];
        if version != FORMAT_VERSION {
            return Err(StoreError::Corrupted(format!(
                "unsupported format version {version}"
            )));
        }

        let stored_checksum = read_u32(&bytes[49..53]);
        if crc32fast::hash(&bytes[0..49]) != stored_checksum {
            return Err(StoreError::Corrupted("header checksum mismatch".to_string()));
        }

        if bytes[1..33] != self.model_id {
            return Err(StoreError::ModelMismatch);
        }

        let header = Header {
            dimensions: read_u32(&bytes[33..37]) as usize,
            entry_count: read_u64(&bytes[37..45]),
            body_checksum: read_u32(&bytes[45..49]),
        };

        Ok(Some((header, bytes)))
    }
}

impl ChunkStore for FileChunkStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    fn load_all(&self) -> Result<Vec<ChunkRecord>, StoreError> {
        let Some((header, bytes)) = self.read()? else {
            return Ok(vec![]);
        };

        let body = &bytes[HEADER_SIZE..];
        if crc32fast::hash(body) != header.body_checksum {
            return Err(StoreError::Corrupted("entry checksum mismatch".to_string()));
        }

        let mut cursor = Cursor { bytes: body, pos: 0 };
        let mut records = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            records.push(cursor.read_entry(header.dimensions)?);
        }

        if cursor.pos != body.len() {
            return Err(StoreError::Corrupted("trailing bytes after entries".to_string()));
        }

        Ok(records)
    }

    fn replace_all(&self, records: &[ChunkRecord]) -> Result<(), StoreError> {
        self.save(records)
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self
            .read()?
            .map(|(header, _)| header.entry_count as usize)
            .unwrap_or(0))
    }

    fn clear(&self) -> Result<(), StoreError> {
        if self.path.exists() {
            std::fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct Header {
    dimensions: usize,
    entry_count: u64,
    body_checksum: u32,
}

fn encode_entry(out: &mut Vec<u8>, record: &ChunkRecord) -> Result<(), StoreError> {
    for field in [
        &record.chunk_id,
        &record.text,
        &record.source_document,
        &record.source_link,
        &record.folder_id,
    ] {
        out.extend_from_slice(&to_u32(field.len(), "string length")?.to_le_bytes());
        out.extend_from_slice(field.as_bytes());
    }

    out.extend_from_slice(&to_u32(record.chunk_index, "chunk_index")?.to_le_bytes());
    out.extend_from_slice(&to_u32(record.total_chunks, "total_chunks")?.to_le_bytes());
    out.extend_from_slice(&record.created_at.timestamp().to_le_bytes());
    out.extend_from_slice(&record.created_at.timestamp_subsec_nanos().to_le_bytes());

    for &value in &record.embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }
    Ok(())
}

fn to_u32(value: usize, field: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Corrupted(format!("{field} value {value} exceeds u32 range")))
}

fn read_u32(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(bytes);
    u32::from_le_bytes(buf)
}

fn read_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(bytes);
    u64::from_le_bytes(buf)
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], StoreError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| StoreError::Corrupted("unexpected end of file".to_string()))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        Ok(read_u32(self.take(4)?))
    }

    fn string(&mut self) -> Result<String, StoreError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        String::from_utf8(raw.to_vec())
            .map_err(|_| StoreError::Corrupted("invalid UTF-8 in entry".to_string()))
    }

    fn read_entry(&mut self, dimensions: usize) -> Result<ChunkRecord, StoreError> {
        let chunk_id = self.string()?;
        let text = self.string()?;
        let source_document = self.string()?;
        let source_link = self.string()?;
        let folder_id = self.string()?;
        let chunk_index = self.u32()? as usize;
        let total_chunks = self.u32()? as usize;

        let secs = read_u64(self.take(8)?) as i64;
        let nanos = self.u32()?;
        let created_at: DateTime<Utc> = DateTime::from_timestamp(secs, nanos)
            .ok_or_else(|| StoreError::Corrupted(format!("invalid timestamp in {chunk_id}")))?;

        let mut embedding = Vec::with_capacity(dimensions);
        for _ in 0..dimensions {
            let mut buf = [0u8; 4];
            buf.copy_from_slice(self.take(4)?);
            embedding.push(f32::from_le_bytes(buf));
        }

        Ok(ChunkRecord {
            chunk_id,
            text,
            embedding,
            source_document,
            source_link,
            chunk_index,
            total_chunks,
            folder_id,
            created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    fn record(id: &str, index: usize, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            chunk_id: format!("{id}_{index}"),
            text: format!("Artículo {index} del documento {id}"),
            embedding,
            source_document: format!("{id}.pdf"),
            source_link: format!("https://drive.google.com/file/d/{id}/view"),
            chunk_index: index,
            total_chunks: 2,
            folder_id: "folder".to_string(),
            created_at: Utc::now(),
        }
    }

    fn store_in(dir: &tempfile::TempDir) -> FileChunkStore {
        FileChunkStore::new(dir.path().join("chunks.bin"), "test-model")
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.load_all().unwrap().is_empty());
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_save_and_load_with_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        let records = vec![
            record("a", 0, vec![1.0, 0.0, 0.0]),
            record("a", 1, vec![0.0, 1.0, 0.0]),
            record("b", 0, vec![0.0, 0.0, 1.0]),
        ];
        store.replace_all(&records).unwrap();

        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(store.load_all().unwrap(), records);
    }

    #[test]
    fn test_replace_overwrites_previous_generation() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);

        store
            .replace_all(&[record("old", 0, vec![1.0]), record("old", 1, vec![2.0])])
            .unwrap();
        store.replace_all(&[record("new", 0, vec![3.0])]).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].chunk_id, "new_0");
        assert!(!store.path().with_extension("tmp").exists());
    }

    #[test]
    fn test_model_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        store_in(&dir).replace_all(&[record("a", 0, vec![1.0])]).unwrap();

        let other = FileChunkStore::new(dir.path().join("chunks.bin"), "other-model");
        assert!(matches!(other.load_all(), Err(StoreError::ModelMismatch)));
    }

    #[test]
    fn test_mixed_dimensions_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        let result = store.replace_all(&[record("a", 0, vec![1.0]), record("a", 1, vec![1.0, 2.0])]);
        assert!(matches!(result, Err(StoreError::Corrupted(_))));
        assert!(!store.path().exists());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.replace_all(&[record("a", 0, vec![1.0, 0.0])]).unwrap();

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(store.path())
            .unwrap();
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + 6)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        assert!(matches!(store.load_all(), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_truncated_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        std::fs::write(store.path(), [FORMAT_VERSION, 0, 0]).unwrap();
        assert!(matches!(store.load_all(), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn test_atomic_write_cleans_up_on_error() {
        let path = PathBuf::from("/nonexistent/directory/chunks.bin");
        let store = FileChunkStore::new(path.clone(), "test-model");

        assert!(store.replace_all(&[record("a", 0, vec![1.0])]).is_err());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        store.replace_all(&[record("a", 0, vec![1.0])]).unwrap();

        store.clear().unwrap();
        assert!(!store.path().exists());
        assert!(store.load_all().unwrap().is_empty());
        // clearing twice is fine
        store.clear().unwrap();
    }
}
