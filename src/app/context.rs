use std::sync::Arc;

use serde::Serialize;

use crate::config::Config;
use crate::semantic::CacheManager;

/// Everything a command or request handler needs, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    config: Arc<Config>,
    manager: Arc<CacheManager>,
}

/// Which settings are present, never their values.
#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentReport {
    pub folder_id: bool,
    pub openai_api_key: bool,
    pub database_url: bool,
    /// "inline", "file", or absent
    pub google_credentials: Option<&'static str>,
    pub embedding_provider: String,
    pub embedding_model: String,
    pub persistence: String,
    pub semantic_search: bool,
    pub base_path: String,
}

impl AppContext {
    pub fn new(config: Arc<Config>, manager: Arc<CacheManager>) -> Self {
        Self { config, manager }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn manager(&self) -> &Arc<CacheManager> {
        &self.manager
    }

    pub fn environment(&self) -> EnvironmentReport {
        let secrets = &self.config.secrets;
        EnvironmentReport {
            folder_id: self.config.folder_id.is_some(),
            openai_api_key: secrets.openai_api_key.is_some(),
            database_url: secrets.database_url.is_some(),
            google_credentials: secrets.credentials.as_ref().map(|c| c.describe()),
            embedding_provider: format!("{:?}", self.config.embedding.provider).to_lowercase(),
            embedding_model: self.config.embedding.model.clone(),
            persistence: self.manager.persistence().to_string(),
            semantic_search: self.manager.embeddings().is_available(),
            base_path: self.config.base_path().display().to_string(),
        }
    }
}
