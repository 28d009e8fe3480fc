use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use homedir::my_home;

use crate::app::context::AppContext;
use crate::config::{Config, EmbeddingProviderKind, StoreBackend};
use crate::drive::{DriveSource, GoogleDrive, UnconfiguredDrive};
use crate::extract::DocumentExtractor;
use crate::semantic::{
    CacheManager, ChunkStore, EmbeddingClient, FileChunkStore, OpenAiEmbedder, PgChunkStore,
    RebuildSettings,
};

const DRIVE_TIMEOUT: Duration = Duration::from_secs(60);

/// Builds the application from configuration and environment.
///
/// Must run outside of an async runtime: the embedding, drive and
/// PostgreSQL clients are blocking.
pub struct AppFactory;

impl AppFactory {
    pub fn load_config() -> Result<Config> {
        let base_path = Self::get_base_path()?;
        Config::load_with(&base_path)
    }

    /// Wire every component. Optional components that fail to initialize
    /// degrade with a warning instead of aborting startup.
    pub fn create_context_with(config: Config) -> AppContext {
        let embeddings = Self::create_embeddings(&config);
        let store = Self::create_store(&config);
        let drive = Self::create_drive(&config);

        let settings = RebuildSettings {
            folder_id: config.folder_id.clone(),
            chunk_size: config.chunking.chunk_size,
            overlap: config.chunking.overlap,
            parallelism: config.rebuild.parallelism,
        };

        let manager = CacheManager::new(
            drive,
            Arc::new(DocumentExtractor::new()),
            embeddings,
            store,
            settings,
        );

        AppContext::new(Arc::new(config), Arc::new(manager))
    }

    /// `DOCSIFT_BASE_PATH`, or `~/.local/share/docsift`. Created if missing.
    pub fn get_base_path() -> Result<PathBuf> {
        let base_path = match std::env::var("DOCSIFT_BASE_PATH") {
            Ok(path) if !path.trim().is_empty() => PathBuf::from(path),
            _ => {
                let home = my_home()
                    .context("could not determine home directory")?
                    .context("home directory path is empty")?;
                home.join(".local/share/docsift")
            }
        };

        std::fs::create_dir_all(&base_path)
            .with_context(|| format!("failed to create base directory {}", base_path.display()))?;

        Ok(base_path)
    }

    fn create_embeddings(config: &Config) -> EmbeddingClient {
        let embedding = &config.embedding;

        match embedding.provider {
            EmbeddingProviderKind::OpenAi => {
                let Some(api_key) = config.secrets.openai_api_key.as_deref() else {
                    log::warn!("OPENAI_API_KEY not set; semantic search disabled, falling back to text matching");
                    return EmbeddingClient::unavailable("OPENAI_API_KEY not set");
                };

                match OpenAiEmbedder::new(
                    api_key,
                    &embedding.base_url,
                    &embedding.model,
                    embedding.dimensions,
                    Duration::from_secs(embedding.timeout_secs),
                    embedding.max_retries,
                ) {
                    Ok(provider) => {
                        log::info!("embeddings: openai model {}", embedding.model);
                        EmbeddingClient::new(
                            Arc::new(provider),
                            embedding.batch_size,
                            embedding.max_input_chars,
                        )
                    }
                    Err(e) => {
                        log::warn!("failed to initialize OpenAI embeddings: {e}");
                        EmbeddingClient::unavailable(e.to_string())
                    }
                }
            }
            EmbeddingProviderKind::Local => Self::create_local_embeddings(config),
        }
    }

    #[cfg(feature = "local-embeddings")]
    fn create_local_embeddings(config: &Config) -> EmbeddingClient {
        use crate::semantic::local_model::LocalEmbedder;

        let embedding = &config.embedding;
        match LocalEmbedder::new(&embedding.model, config.base_path().to_path_buf()) {
            Ok(provider) => {
                log::info!(
                    "embeddings: local model {} ({} dimensions)",
                    embedding.model,
                    provider.dimensions()
                );
                EmbeddingClient::new(
                    Arc::new(provider),
                    embedding.batch_size,
                    embedding.max_input_chars,
                )
            }
            Err(e) => {
                log::warn!("failed to load local embedding model: {e}");
                EmbeddingClient::unavailable(e.to_string())
            }
        }
    }

    #[cfg(not(feature = "local-embeddings"))]
    fn create_local_embeddings(_config: &Config) -> EmbeddingClient {
        log::warn!("local embeddings requested but docsift was built without the `local-embeddings` feature");
        EmbeddingClient::unavailable("built without the local-embeddings feature")
    }

    fn create_store(config: &Config) -> Option<Arc<dyn ChunkStore>> {
        let model = &config.embedding.model;

        match config.resolved_store_backend() {
            StoreBackend::Postgres => {
                let Some(url) = config.secrets.database_url.as_deref() else {
                    log::warn!("postgres store selected but DATABASE_URL not set; running without persistence");
                    return None;
                };
                match PgChunkStore::connect(url, &config.store.table, model) {
                    Ok(store) => {
                        log::info!("durable store: postgres table {}", config.store.table);
                        Some(Arc::new(store))
                    }
                    Err(e) => {
                        log::warn!("failed to connect to postgres: {e}; running without persistence");
                        None
                    }
                }
            }
            StoreBackend::File => {
                let store = FileChunkStore::new(
                    Self::store_path(config.base_path(), &config.store.file_name),
                    model,
                );
                log::info!("durable store: file {}", store.path().display());
                Some(Arc::new(store))
            }
            StoreBackend::Disabled | StoreBackend::Auto => {
                log::info!("durable store disabled; cache is memory only");
                None
            }
        }
    }

    fn store_path(base_path: &Path, file_name: &str) -> PathBuf {
        base_path.join(file_name)
    }

    fn create_drive(config: &Config) -> Arc<dyn DriveSource> {
        let Some(source) = config.secrets.credentials.as_ref() else {
            log::warn!("no Google credentials configured; rebuilds will fail until they are set");
            return Arc::new(UnconfiguredDrive::new("no Google credentials configured"));
        };

        let drive = source
            .resolve()
            .map_err(|e| e.to_string())
            .and_then(|key| GoogleDrive::new(key, DRIVE_TIMEOUT).map_err(|e| e.to_string()));

        match drive {
            Ok(drive) => Arc::new(drive),
            Err(reason) => {
                log::warn!("failed to initialize Google Drive client: {reason}");
                Arc::new(UnconfiguredDrive::new(reason))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::semantic::manager::CacheState;

    #[test]
    fn test_context_without_secrets_degrades() {
        let mut config = Config::default();
        config.store.backend = StoreBackend::Disabled;
        config.folder_id = Some("folder".to_string());

        let ctx = AppFactory::create_context_with(config);
        let manager = ctx.manager();

        assert_eq!(manager.state(), CacheState::Empty);
        assert!(!manager.embeddings().is_available());
        assert_eq!(manager.persistence(), "disabled");
    }

    #[test]
    fn test_store_path_joins_base() {
        let path = AppFactory::store_path(Path::new("/data"), "chunks.bin");
        assert_eq!(path, PathBuf::from("/data/chunks.bin"));
    }
}
