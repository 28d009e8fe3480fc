//! In-process stand-ins for every external collaborator.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::drive::{DriveError, DriveFile, DriveSource};
use crate::extract::DocumentExtractor;
use crate::semantic::embeddings::EmbeddingProvider;
use crate::semantic::record::ChunkRecord;
use crate::semantic::store::StoreError;
use crate::semantic::{CacheManager, ChunkStore, EmbeddingClient, EmbeddingError, RebuildSettings};

pub const FOLDER: &str = "folder-1";

/// Words the fake embedder projects onto, one dimension each.
const VOCABULARY: [&str; 3] = ["water", "fire", "tax"];

pub fn text_file(id: &str, name: &str) -> DriveFile {
    DriveFile {
        id: id.to_string(),
        name: name.to_string(),
        mime_type: "text/plain".to_string(),
        web_view_link: Some(format!("https://drive.example/{id}")),
    }
}

/// Pauses a fake call until the test lets it continue.
pub struct Gate {
    entered_tx: Mutex<Sender<()>>,
    release_rx: Mutex<Receiver<()>>,
}

pub struct GateHandle {
    entered_rx: Receiver<()>,
    release_tx: Sender<()>,
}

impl GateHandle {
    /// Block until the gated call has started.
    pub fn wait_entered(&self) {
        self.entered_rx.recv().unwrap();
    }

    pub fn release(&self) {
        self.release_tx.send(()).unwrap();
    }
}

pub fn gate() -> (Gate, GateHandle) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    (
        Gate {
            entered_tx: Mutex::new(entered_tx),
            release_rx: Mutex::new(release_rx),
        },
        GateHandle {
            entered_rx,
            release_tx,
        },
    )
}

#[derive(Default)]
pub struct FakeDrive {
    files: Mutex<Vec<DriveFile>>,
    contents: Mutex<HashMap<String, Result<String, String>>>,
    gate: Option<Gate>,
    pub panic_on_list: AtomicBool,
    pub list_calls: AtomicUsize,
    pub download_calls: AtomicUsize,
}

impl FakeDrive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn gated(gate: Gate) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn add(&self, id: &str, name: &str, text: &str) {
        self.add_file(text_file(id, name), text);
    }

    pub fn add_file(&self, file: DriveFile, text: &str) {
        let id = file.id.clone();
        self.files.lock().unwrap().push(file);
        self.contents
            .lock()
            .unwrap()
            .insert(id, Ok(text.to_string()));
    }

    /// A listed file whose download fails.
    pub fn add_broken(&self, id: &str, name: &str) {
        self.files.lock().unwrap().push(text_file(id, name));
        self.contents
            .lock()
            .unwrap()
            .insert(id.to_string(), Err("download refused".to_string()));
    }

    pub fn break_all(&self) {
        for value in self.contents.lock().unwrap().values_mut() {
            *value = Err("download refused".to_string());
        }
    }

    pub fn calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst) + self.download_calls.load(Ordering::SeqCst)
    }
}

impl DriveSource for FakeDrive {
    fn list_files(&self, _folder_id: &str) -> Result<Vec<DriveFile>, DriveError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.panic_on_list.load(Ordering::SeqCst) {
            panic!("drive listing blew up");
        }
        if let Some(gate) = &self.gate {
            gate.entered_tx.lock().unwrap().send(()).unwrap();
            gate.release_rx.lock().unwrap().recv().unwrap();
        }
        Ok(self.files.lock().unwrap().clone())
    }

    fn download(&self, file: &DriveFile) -> Result<Vec<u8>, DriveError> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);
        match self.contents.lock().unwrap().get(&file.id) {
            Some(Ok(text)) => Ok(text.as_bytes().to_vec()),
            Some(Err(reason)) => Err(DriveError::Api {
                status: 500,
                body: reason.clone(),
            }),
            None => Err(DriveError::Api {
                status: 404,
                body: "not found".to_string(),
            }),
        }
    }
}

/// Embeds text as word counts over a tiny vocabulary plus a constant bias.
#[derive(Default)]
pub struct KeywordEmbedder {
    pub calls: AtomicUsize,
    pub fail: AtomicBool,
}

impl KeywordEmbedder {
    pub fn vector(text: &str) -> Vec<f32> {
        let lower = text.to_lowercase();
        let mut v: Vec<f32> = VOCABULARY
            .iter()
            .map(|word| lower.matches(word).count() as f32)
            .collect();
        v.push(0.1);
        v
    }
}

impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword-test"
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Provider("rate limited".to_string()));
        }
        Ok(texts.iter().map(|t| Self::vector(t)).collect())
    }
}

#[derive(Default)]
pub struct MemoryStore {
    records: Mutex<Vec<ChunkRecord>>,
    clear_gate: Option<Gate>,
    pub fail_writes: AtomicBool,
    pub fail_counts: AtomicBool,
    pub loads: AtomicUsize,
}

impl MemoryStore {
    pub fn with_records(records: Vec<ChunkRecord>) -> Self {
        Self {
            records: Mutex::new(records),
            ..Self::default()
        }
    }

    /// `clear` pauses until the test releases it.
    pub fn gated_clear(gate: Gate) -> Self {
        Self {
            clear_gate: Some(gate),
            ..Self::default()
        }
    }

    pub fn records(&self) -> Vec<ChunkRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl ChunkStore for MemoryStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn load_all(&self) -> Result<Vec<ChunkRecord>, StoreError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        Ok(self.records())
    }

    fn replace_all(&self, records: &[ChunkRecord]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        *self.records.lock().unwrap() = records.to_vec();
        Ok(())
    }

    fn count(&self) -> Result<usize, StoreError> {
        if self.fail_counts.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".to_string()));
        }
        Ok(self.records.lock().unwrap().len())
    }

    fn clear(&self) -> Result<(), StoreError> {
        if let Some(gate) = &self.clear_gate {
            gate.entered_tx.lock().unwrap().send(()).unwrap();
            gate.release_rx.lock().unwrap().recv().unwrap();
        }
        self.records.lock().unwrap().clear();
        Ok(())
    }
}

/// A manager over fakes, plus handles to inspect them.
pub struct Harness {
    pub manager: Arc<CacheManager>,
    pub drive: Arc<FakeDrive>,
    pub embedder: Arc<KeywordEmbedder>,
    pub store: Arc<MemoryStore>,
}

pub struct HarnessBuilder {
    drive: FakeDrive,
    store: MemoryStore,
    embeddings_available: bool,
    persist: bool,
    folder_id: Option<String>,
    chunk_size: usize,
    overlap: usize,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            drive: FakeDrive::new(),
            store: MemoryStore::default(),
            embeddings_available: true,
            persist: true,
            folder_id: Some(FOLDER.to_string()),
            chunk_size: 200,
            overlap: 20,
        }
    }
}

impl HarnessBuilder {
    pub fn drive(mut self, drive: FakeDrive) -> Self {
        self.drive = drive;
        self
    }

    pub fn store(mut self, store: MemoryStore) -> Self {
        self.store = store;
        self
    }

    pub fn without_embeddings(mut self) -> Self {
        self.embeddings_available = false;
        self
    }

    pub fn without_store(mut self) -> Self {
        self.persist = false;
        self
    }

    pub fn without_folder(mut self) -> Self {
        self.folder_id = None;
        self
    }

    pub fn build(self) -> Harness {
        let drive = Arc::new(self.drive);
        let embedder = Arc::new(KeywordEmbedder::default());
        let store = Arc::new(self.store);

        let embeddings = if self.embeddings_available {
            EmbeddingClient::new(embedder.clone(), 8, 10_000)
        } else {
            EmbeddingClient::unavailable("OPENAI_API_KEY not set")
        };

        let durable: Option<Arc<dyn ChunkStore>> = if self.persist {
            Some(store.clone() as Arc<dyn ChunkStore>)
        } else {
            None
        };

        let settings = RebuildSettings {
            folder_id: self.folder_id,
            chunk_size: self.chunk_size,
            overlap: self.overlap,
            parallelism: 2,
        };

        let manager = Arc::new(CacheManager::new(
            drive.clone(),
            Arc::new(DocumentExtractor::new()),
            embeddings,
            durable,
            settings,
        ));

        Harness {
            manager,
            drive,
            embedder,
            store,
        }
    }
}

/// Drive with one document per topic.
pub fn topic_drive() -> FakeDrive {
    let drive = FakeDrive::new();
    drive.add("w", "Water rights.txt", "Rules for water use and water permits.");
    drive.add("f", "Fire code.txt", "Fire exits and fire alarms in public buildings.");
    drive.add("t", "Tax guide.txt", "How the property tax is assessed.");
    drive
}
