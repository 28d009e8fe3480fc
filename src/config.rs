use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::credentials::{self, CredentialSource};
use crate::semantic::chunker::{DEFAULT_CHUNK_SIZE, DEFAULT_OVERLAP};
use crate::semantic::preprocess::DEFAULT_MAX_INPUT_CHARS;
use crate::semantic::DEFAULT_MODEL;

const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8000";
const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: usize = 3;
const DEFAULT_BATCH_SIZE: usize = 64;
const DEFAULT_TABLE: &str = "document_chunks";
const DEFAULT_STORE_FILE: &str = "chunks.bin";
const DEFAULT_TOP_K: usize = 10;
const MAX_TOP_K: usize = 50;
const DEFAULT_PARALLELISM: usize = 4;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Target segment length in characters
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Characters shared by consecutive segments
    #[serde(default = "default_overlap")]
    pub overlap: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_OVERLAP,
        }
    }
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_overlap() -> usize {
    DEFAULT_OVERLAP
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    OpenAi,
    /// fastembed, requires the `local-embeddings` feature
    Local,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: EmbeddingProviderKind,

    #[serde(default = "default_model")]
    pub model: String,

    /// OpenAI-compatible API root
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Requested output dimensions, if the model supports shortening
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<usize>,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Retries for rate limits, server errors and transport failures
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Inputs per provider call
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Longer inputs are truncated
    #[serde(default = "default_max_input_chars")]
    pub max_input_chars: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::OpenAi,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            dimensions: None,
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            batch_size: DEFAULT_BATCH_SIZE,
            max_input_chars: DEFAULT_MAX_INPUT_CHARS,
        }
    }
}

fn default_provider() -> EmbeddingProviderKind {
    EmbeddingProviderKind::OpenAi
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_max_input_chars() -> usize {
    DEFAULT_MAX_INPUT_CHARS
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// PostgreSQL when DATABASE_URL is set, otherwise the file store
    Auto,
    Postgres,
    File,
    /// Memory only
    #[serde(rename = "none")]
    Disabled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_backend")]
    pub backend: StoreBackend,

    #[serde(default = "default_table")]
    pub table: String,

    /// File name under the base path for the file backend
    #[serde(default = "default_store_file")]
    pub file_name: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Auto,
            table: DEFAULT_TABLE.to_string(),
            file_name: DEFAULT_STORE_FILE.to_string(),
        }
    }
}

fn default_backend() -> StoreBackend {
    StoreBackend::Auto
}

fn default_table() -> String {
    DEFAULT_TABLE.to_string()
}

fn default_store_file() -> String {
    DEFAULT_STORE_FILE.to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub default_top_k: usize,

    /// Requests asking for more are capped
    #[serde(default = "max_top_k")]
    pub max_top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_top_k: DEFAULT_TOP_K,
            max_top_k: MAX_TOP_K,
        }
    }
}

impl SearchConfig {
    /// Requested `top_k`, defaulted and capped.
    pub fn effective_top_k(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_top_k)
            .clamp(1, self.max_top_k)
    }
}

fn default_top_k() -> usize {
    DEFAULT_TOP_K
}

fn max_top_k() -> usize {
    MAX_TOP_K
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RebuildConfig {
    /// Files downloaded and embedded concurrently
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            parallelism: DEFAULT_PARALLELISM,
        }
    }
}

fn default_parallelism() -> usize {
    DEFAULT_PARALLELISM
}

/// Values that only ever come from the environment.
#[derive(Clone, Debug, Default)]
pub struct Secrets {
    pub openai_api_key: Option<String>,
    pub database_url: Option<String>,
    pub credentials: Option<CredentialSource>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Drive folder to index
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub rebuild: RebuildConfig,

    #[serde(skip)]
    pub secrets: Secrets,

    #[serde(skip)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            folder_id: None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            chunking: ChunkingConfig::default(),
            embedding: EmbeddingConfig::default(),
            store: StoreConfig::default(),
            search: SearchConfig::default(),
            rebuild: RebuildConfig::default(),
            secrets: Secrets::default(),
            base_path: PathBuf::new(),
        }
    }
}

fn default_listen_addr() -> String {
    DEFAULT_LISTEN_ADDR.to_string()
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chunking.chunk_size == 0 {
            bail!("chunking.chunk_size must be greater than 0");
        }
        if self.chunking.overlap >= self.chunking.chunk_size {
            bail!(
                "chunking.overlap ({}) must be smaller than chunking.chunk_size ({})",
                self.chunking.overlap,
                self.chunking.chunk_size
            );
        }
        if self.embedding.batch_size == 0 {
            bail!("embedding.batch_size must be greater than 0");
        }
        if self.embedding.timeout_secs == 0 {
            bail!("embedding.timeout_secs must be greater than 0");
        }
        if self.embedding.max_input_chars == 0 {
            bail!("embedding.max_input_chars must be greater than 0");
        }
        if self.embedding.dimensions == Some(0) {
            bail!("embedding.dimensions must be greater than 0 when set");
        }
        if self.rebuild.parallelism == 0 {
            bail!("rebuild.parallelism must be greater than 0");
        }
        if self.search.default_top_k == 0 {
            bail!("search.default_top_k must be greater than 0");
        }
        if self.search.default_top_k > self.search.max_top_k {
            bail!(
                "search.default_top_k ({}) cannot exceed search.max_top_k ({})",
                self.search.default_top_k,
                self.search.max_top_k
            );
        }
        match url::Url::parse(&self.embedding.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            _ => bail!(
                "embedding.base_url '{}' must be an http(s) URL",
                self.embedding.base_url
            ),
        }
        if self.listen_addr.parse::<std::net::SocketAddr>().is_err() {
            bail!("listen_addr '{}' is not a valid socket address", self.listen_addr);
        }
        Ok(())
    }

    /// Load `<base_path>/config.yaml`, creating it with defaults if missing,
    /// then apply environment overrides.
    pub fn load_with(base_path: &Path) -> Result<Self> {
        Self::load_with_env(base_path, |key| std::env::var(key).ok())
    }

    fn load_with_env(base_path: &Path, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&path, defaults)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", path.display()))?;
        config.base_path = base_path.to_path_buf();

        // resave in case config version needs an upgrade; before env overrides
        let upgraded = serde_yml::to_string(&config)?;
        if config_str != upgraded {
            std::fs::write(&path, upgraded)
                .with_context(|| format!("failed to update {}", path.display()))?;
        }

        config.apply_env(env);
        config.validate()?;

        Ok(config)
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        let non_blank = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(folder_id) = non_blank("FOLDER_ID") {
            self.folder_id = Some(folder_id);
        }
        if let Some(addr) = non_blank("DOCSIFT_LISTEN_ADDR") {
            self.listen_addr = addr;
        }

        self.secrets = Secrets {
            openai_api_key: non_blank("OPENAI_API_KEY"),
            database_url: non_blank("DATABASE_URL"),
            credentials: CredentialSource::from_values(
                env(credentials::ENV_INLINE),
                env(credentials::ENV_FILE),
            ),
        };
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Which durable backend this configuration resolves to.
    pub fn resolved_store_backend(&self) -> StoreBackend {
        match self.store.backend {
            StoreBackend::Auto if self.secrets.database_url.is_some() => StoreBackend::Postgres,
            StoreBackend::Auto => StoreBackend::File,
            other => other,
        }
    }
}
