//! Cache manager: the single owner of the chunk cache lifecycle.
//!
//! - cold start from the durable store (no drive or embedding calls)
//! - full rebuild: list, download, extract, chunk, embed, persist, publish
//! - explicit clear
//!
//! At most one rebuild runs at a time. Entering `Loading` is the guard: a
//! second request while loading is rejected with `RebuildInProgress`. A
//! failed rebuild restores the previous state and leaves the last good
//! generation in place.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::Serialize;

use crate::drive::{DriveError, DriveFile, DriveSource};
use crate::extract::Extractor;
use crate::semantic::cache::{CacheError, ChunkCache};
use crate::semantic::chunker::{chunk_text, DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP};
use crate::semantic::embeddings::{EmbeddingClient, EmbeddingError};
use crate::semantic::record::{ChunkRecord, SourceDocument};
use crate::semantic::search::{self, SearchResponse};
use crate::semantic::store::{ChunkStore, StoreError};

/// Lifecycle of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Empty,
    Loading,
    Ready,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildKind {
    /// Skipped when the cache is already ready
    Warmup,
    /// Always rebuilds
    Refresh,
}

impl RebuildKind {
    fn as_str(self) -> &'static str {
        match self {
            RebuildKind::Warmup => "warmup",
            RebuildKind::Refresh => "refresh",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RebuildError {
    #[error("a cache rebuild is already in progress")]
    InProgress,

    #[error("embeddings unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("no source folder configured (set FOLDER_ID)")]
    NoFolder,

    #[error("failed to list source files: {0}")]
    Drive(#[from] DriveError),

    #[error("nothing indexed: {failed} of {files} file(s) failed")]
    NothingIndexed { files: usize, failed: usize },

    #[error("invalid chunk set: {0}")]
    Cache(#[from] CacheError),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Rebuild tuning.
#[derive(Debug, Clone)]
pub struct RebuildSettings {
    pub folder_id: Option<String>,
    pub chunk_size: usize,
    pub overlap: usize,
    /// Files processed concurrently
    pub parallelism: usize,
}

impl Default for RebuildSettings {
    fn default() -> Self {
        Self {
            folder_id: None,
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
            parallelism: 4,
        }
    }
}

/// A source file that was skipped during a rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileFailure {
    pub file_id: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub succeeded_files: usize,
    pub failed_files: Vec<FileFailure>,
    pub total_chunks: usize,
    pub total_documents: usize,
    pub generation: u64,
    /// Whether the new generation reached the durable store
    pub persisted: bool,
    /// Warmup found the cache already ready and did nothing
    pub skipped: bool,
    pub elapsed_ms: u64,
}

impl RebuildReport {
    pub fn is_partial(&self) -> bool {
        !self.failed_files.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub state: CacheState,
    pub size: usize,
    pub generation: u64,
    pub last_populated_at: Option<DateTime<Utc>>,
    pub documents: usize,
    pub dimensions: usize,
    /// Durable backend name, or "disabled"
    pub persistence: String,
    /// Records in the durable store; `None` when disabled or unreachable
    pub stored_chunks: Option<usize>,
    pub semantic_search: bool,
    pub embedding_model: Option<String>,
    pub folder_id: Option<String>,
}

/// First files of the source folder, for connectivity checks.
#[derive(Debug, Clone, Serialize)]
pub struct DriveCheck {
    pub folder_id: String,
    pub total_files: usize,
    pub files: Vec<DriveFile>,
}

/// Outcome of embedding a single test text.
#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingCheck {
    pub model: Option<String>,
    pub dimensions: usize,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClearReport {
    pub cleared_chunks: usize,
    pub store_cleared: bool,
}

/// Holds the cache in `Loading`. Dropping it without `commit` restores the
/// state it replaced.
pub struct RebuildTicket {
    state: Arc<Mutex<CacheState>>,
    previous: CacheState,
    label: &'static str,
    committed: bool,
}

impl RebuildTicket {
    /// What holds the slot: "warmup", "refresh", "cold start" or "clear".
    pub fn label(&self) -> &'static str {
        self.label
    }

    fn commit(mut self, state: CacheState) {
        *lock(&self.state) = state;
        self.committed = true;
    }
}

impl Drop for RebuildTicket {
    fn drop(&mut self) {
        if !self.committed {
            *lock(&self.state) = self.previous;
        }
    }
}

/// Recover from poisoning; the state is a plain enum and always valid.
fn lock(state: &Mutex<CacheState>) -> MutexGuard<'_, CacheState> {
    match state.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

pub struct CacheManager {
    cache: ChunkCache,
    state: Arc<Mutex<CacheState>>,
    drive: Arc<dyn DriveSource>,
    extractor: Arc<dyn Extractor>,
    embeddings: EmbeddingClient,
    store: Option<Arc<dyn ChunkStore>>,
    settings: RebuildSettings,
}

impl CacheManager {
    pub fn new(
        drive: Arc<dyn DriveSource>,
        extractor: Arc<dyn Extractor>,
        embeddings: EmbeddingClient,
        store: Option<Arc<dyn ChunkStore>>,
        settings: RebuildSettings,
    ) -> Self {
        Self {
            cache: ChunkCache::new(),
            state: Arc::new(Mutex::new(CacheState::Empty)),
            drive,
            extractor,
            embeddings,
            store,
            settings,
        }
    }

    pub fn state(&self) -> CacheState {
        *lock(&self.state)
    }

    pub fn embeddings(&self) -> &EmbeddingClient {
        &self.embeddings
    }

    pub fn persistence(&self) -> &'static str {
        self.store.as_ref().map(|s| s.kind()).unwrap_or("disabled")
    }

    /// Populate the cache from the durable store.
    ///
    /// Never fails: an empty, unavailable or incompatible store leaves the
    /// cache empty. Returns the number of records loaded.
    pub fn cold_start(&self) -> usize {
        let Some(store) = self.store.as_ref() else {
            log::warn!("no durable store configured; cache starts empty");
            return 0;
        };

        let ticket = match self.enter_loading("cold start") {
            Ok(ticket) => ticket,
            Err(_) => {
                log::warn!("cold start skipped: a rebuild is already running");
                return 0;
            }
        };

        let records = match store.load_all() {
            Ok(records) => records,
            Err(StoreError::ModelMismatch) => {
                log::warn!("stored chunks were embedded with another model; ignoring them");
                return 0;
            }
            Err(e) => {
                log::warn!("failed to load chunks from {} store: {e}", store.kind());
                return 0;
            }
        };

        if records.is_empty() {
            log::info!("durable store is empty; cache not warmed");
            return 0;
        }

        if let Some(folder_id) = self.settings.folder_id.as_deref() {
            if let Some(other) = records.iter().find(|r| r.folder_id != folder_id) {
                log::warn!(
                    "stored chunks belong to folder {}, configured folder is {folder_id}; ignoring them",
                    other.folder_id
                );
                return 0;
            }
        }

        let loaded = records.len();
        match self.cache.replace(records) {
            Ok(generation) => {
                ticket.commit(CacheState::Ready);
                log::info!(
                    "cold start: loaded {loaded} chunk(s) from {} store (generation {generation})",
                    store.kind()
                );
                loaded
            }
            Err(e) => {
                log::warn!("stored chunks rejected: {e}");
                0
            }
        }
    }

    /// Rebuild unless the cache is already ready.
    pub fn warmup(&self) -> Result<RebuildReport, RebuildError> {
        match self.begin_rebuild(RebuildKind::Warmup)? {
            Some(ticket) => self.run_rebuild(ticket),
            None => Ok(self.skipped_report()),
        }
    }

    /// Always rebuild.
    pub fn refresh(&self) -> Result<RebuildReport, RebuildError> {
        match self.begin_rebuild(RebuildKind::Refresh)? {
            Some(ticket) => self.run_rebuild(ticket),
            None => Ok(self.skipped_report()),
        }
    }

    /// Claim the rebuild slot.
    ///
    /// Returns `None` for a warmup that has nothing to do. Split from
    /// `run_rebuild` so callers can reject or accept a request before
    /// running the rebuild elsewhere.
    pub fn begin_rebuild(&self, kind: RebuildKind) -> Result<Option<RebuildTicket>, RebuildError> {
        if let Some(reason) = self.embeddings.unavailable_reason() {
            return Err(RebuildError::EmbeddingUnavailable(reason.to_string()));
        }
        if self.settings.folder_id.is_none() {
            return Err(RebuildError::NoFolder);
        }

        if kind == RebuildKind::Warmup && self.state() == CacheState::Ready && self.cache.is_ready() {
            log::info!("warmup skipped: cache already holds generation {}", self.cache.generation());
            return Ok(None);
        }

        self.enter_loading(kind.as_str()).map(Some)
    }

    pub fn run_rebuild(&self, ticket: RebuildTicket) -> Result<RebuildReport, RebuildError> {
        let started = Instant::now();
        let folder_id = self
            .settings
            .folder_id
            .clone()
            .ok_or(RebuildError::NoFolder)?;

        log::info!("{} started for folder {folder_id}", ticket.label());

        let files = self.drive.list_files(&folder_id)?;
        let created_at = Utc::now();

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.settings.parallelism.max(1))
            .build()
            .map_err(|e| RebuildError::Internal(format!("failed to start worker pool: {e}")))?;

        let outcomes: Vec<Result<Vec<ChunkRecord>, String>> = pool.install(|| {
            files
                .par_iter()
                .map(|file| self.process_file(file, &folder_id, created_at))
                .collect()
        });

        let mut records = Vec::new();
        let mut failures = Vec::new();
        let mut succeeded = 0;
        for (file, outcome) in files.iter().zip(outcomes) {
            match outcome {
                Ok(chunks) => {
                    log::info!("indexed {} ({} chunk(s))", file.name, chunks.len());
                    succeeded += 1;
                    records.extend(chunks);
                }
                Err(reason) => {
                    log::warn!("skipped {} ({}): {reason}", file.name, file.id);
                    failures.push(FileFailure {
                        file_id: file.id.clone(),
                        name: file.name.clone(),
                        reason,
                    });
                }
            }
        }

        if records.is_empty() {
            log::error!(
                "{} produced no chunks ({} of {} file(s) failed); keeping generation {}",
                ticket.label(),
                failures.len(),
                files.len(),
                self.cache.generation()
            );
            return Err(RebuildError::NothingIndexed {
                files: files.len(),
                failed: failures.len(),
            });
        }

        // reject a bad set before it reaches either tier
        ChunkCache::validate(&records)?;

        let persisted = match self.store.as_ref() {
            Some(store) => match store.replace_all(&records) {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("failed to persist chunks to {} store: {e}; continuing in memory", store.kind());
                    false
                }
            },
            None => false,
        };

        let total_chunks = records.len();
        let generation = self.cache.replace(records)?;
        ticket.commit(CacheState::Ready);

        let report = RebuildReport {
            succeeded_files: succeeded,
            failed_files: failures,
            total_chunks,
            total_documents: self.cache.snapshot().document_count(),
            generation,
            persisted,
            skipped: false,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };

        if report.is_partial() {
            log::warn!(
                "published generation {generation}: {total_chunks} chunk(s) from {} file(s), {} failed, persisted={persisted}",
                report.succeeded_files,
                report.failed_files.len()
            );
        } else {
            log::info!(
                "published generation {generation}: {total_chunks} chunk(s) from {} file(s), persisted={persisted}",
                report.succeeded_files
            );
        }

        Ok(report)
    }

    /// Download, extract, chunk and embed one file.
    fn process_file(
        &self,
        file: &DriveFile,
        folder_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<Vec<ChunkRecord>, String> {
        if !self.extractor.supports(&file.mime_type) {
            return Err(format!("unsupported format: {}", file.mime_type));
        }

        let bytes = self.drive.download(file).map_err(|e| e.to_string())?;
        let text = self
            .extractor
            .extract(&bytes, file.content_mime())
            .map_err(|e| e.to_string())?;

        let segments = chunk_text(&text, self.settings.chunk_size, self.settings.overlap)
            .map_err(|e| e.to_string())?;
        if segments.is_empty() {
            return Err("no extractable text".to_string());
        }

        let embeddings = self
            .embeddings
            .embed_batch(&segments)
            .map_err(|e| e.to_string())?;

        let doc = SourceDocument {
            file_id: file.id.clone(),
            name: file.name.clone(),
            link: file.link(),
            folder_id: folder_id.to_string(),
        };
        Ok(doc.into_records(segments, embeddings, created_at))
    }

    pub fn search(&self, query: &str, top_k: usize) -> SearchResponse {
        let snapshot = self.cache.snapshot();
        search::search(&snapshot, &self.embeddings, query, top_k)
    }

    pub fn status(&self) -> CacheStatus {
        let state = self.state();
        let snapshot = self.cache.snapshot();

        CacheStatus {
            state,
            size: snapshot.len(),
            generation: snapshot.number(),
            last_populated_at: snapshot.populated_at(),
            documents: snapshot.document_count(),
            dimensions: snapshot.dimensions(),
            persistence: self.persistence().to_string(),
            stored_chunks: self.stored_count(),
            semantic_search: self.embeddings.is_available(),
            embedding_model: self.embeddings.model_name().map(str::to_string),
            folder_id: self.settings.folder_id.clone(),
        }
    }

    /// Record count of the durable tier. May block on a database round trip.
    pub fn stored_count(&self) -> Option<usize> {
        let store = self.store.as_ref()?;
        match store.count() {
            Ok(count) => Some(count),
            Err(e) => {
                log::warn!("failed to count chunks in {} store: {e}", store.kind());
                None
            }
        }
    }

    /// List the source folder and return up to `limit` files.
    pub fn check_drive(&self, limit: usize) -> Result<DriveCheck, RebuildError> {
        let folder_id = self
            .settings
            .folder_id
            .clone()
            .ok_or(RebuildError::NoFolder)?;

        let mut files = self.drive.list_files(&folder_id)?;
        let total_files = files.len();
        files.truncate(limit);

        Ok(DriveCheck {
            folder_id,
            total_files,
            files,
        })
    }

    /// Embed one short text to check the provider end to end.
    pub fn check_embeddings(&self) -> Result<EmbeddingCheck, EmbeddingError> {
        let started = Instant::now();
        let vector = self.embeddings.embed("connectivity check")?;

        Ok(EmbeddingCheck {
            model: self.embeddings.model_name().map(str::to_string),
            dimensions: vector.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Empty both tiers. Rejected while a rebuild is running.
    ///
    /// Holds the rebuild slot, not the state lock, while the store is cleared.
    pub fn clear(&self) -> Result<ClearReport, RebuildError> {
        let ticket = self.enter_loading("clear")?;

        let cleared_chunks = self.cache.size();
        self.cache.clear();

        let store_cleared = match self.store.as_ref() {
            Some(store) => match store.clear() {
                Ok(()) => true,
                Err(e) => {
                    log::warn!("failed to clear {} store: {e}", store.kind());
                    false
                }
            },
            None => false,
        };
        ticket.commit(CacheState::Empty);

        log::info!("cache cleared ({cleared_chunks} chunk(s) dropped)");
        Ok(ClearReport {
            cleared_chunks,
            store_cleared,
        })
    }

    fn enter_loading(&self, label: &'static str) -> Result<RebuildTicket, RebuildError> {
        let mut state = lock(&self.state);
        if *state == CacheState::Loading {
            return Err(RebuildError::InProgress);
        }

        let previous = *state;
        *state = CacheState::Loading;
        Ok(RebuildTicket {
            state: Arc::clone(&self.state),
            previous,
            label,
            committed: false,
        })
    }

    fn skipped_report(&self) -> RebuildReport {
        let snapshot = self.cache.snapshot();
        RebuildReport {
            succeeded_files: 0,
            failed_files: vec![],
            total_chunks: snapshot.len(),
            total_documents: snapshot.document_count(),
            generation: snapshot.number(),
            persisted: false,
            skipped: true,
            elapsed_ms: 0,
        }
    }
}
