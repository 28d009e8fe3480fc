//! Google service-account credentials.
//!
//! Credentials come either inline (base64 JSON, for container deployments)
//! or from a key file. They are resolved once at startup into a
//! `ServiceAccountKey`; nothing downstream cares where they came from.

use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;

pub const ENV_INLINE: &str = "GOOGLE_CREDENTIALS_BASE64";
pub const ENV_FILE: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("failed to decode base64 credentials: {0}")]
    Decode(String),

    #[error("failed to read credentials file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid service account JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialSource {
    /// Base64-encoded service account JSON
    Inline(String),
    /// Path to a service account JSON file
    File(PathBuf),
}

/// The fields of a service account key needed for the JWT grant.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl CredentialSource {
    /// Inline credentials take precedence over a key file.
    pub fn from_values(inline: Option<String>, file: Option<String>) -> Option<Self> {
        let non_blank = |v: Option<String>| v.filter(|s| !s.trim().is_empty());

        non_blank(inline)
            .map(CredentialSource::Inline)
            .or_else(|| non_blank(file).map(|p| CredentialSource::File(PathBuf::from(p))))
    }

    pub fn describe(&self) -> &'static str {
        match self {
            CredentialSource::Inline(_) => "inline",
            CredentialSource::File(_) => "file",
        }
    }

    pub fn resolve(&self) -> Result<ServiceAccountKey, CredentialError> {
        let json = match self {
            CredentialSource::Inline(encoded) => {
                let bytes = STANDARD
                    .decode(encoded.trim())
                    .map_err(|e| CredentialError::Decode(e.to_string()))?;
                String::from_utf8(bytes).map_err(|e| CredentialError::Decode(e.to_string()))?
            }
            CredentialSource::File(path) => {
                std::fs::read_to_string(path).map_err(|source| CredentialError::Io {
                    path: path.clone(),
                    source,
                })?
            }
        };

        let key: ServiceAccountKey = serde_json::from_str(&json)?;
        log::info!(
            "loaded {} Google credentials for {}",
            self.describe(),
            key.client_email
        );
        Ok(key)
    }
}
