//! Source collection client.
//!
//! `DriveSource` is the narrow capability the rebuild needs: list the files
//! of a folder and fetch their bytes. `GoogleDrive` implements it against the
//! Drive v3 REST API with a service-account JWT grant.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

use crate::credentials::ServiceAccountKey;

pub const GOOGLE_DOC_MIME: &str = "application/vnd.google-apps.document";
pub const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
pub const DOCX_MIME: &str = "application/vnd.openxmlformats-officedocument.wordprocessingml.document";

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive.readonly";
const PAGE_SIZE: &str = "1000";
/// Refresh tokens this long before they expire
const TOKEN_SLACK: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum DriveError {
    #[error("drive unavailable: {0}")]
    Unavailable(String),

    #[error("drive authentication failed: {0}")]
    Auth(String),

    #[error("drive request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("drive API error ({status}): {body}")]
    Api { status: u16, body: String },
}

/// A file in the source folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    pub mime_type: String,
    #[serde(default)]
    pub web_view_link: Option<String>,
}

impl DriveFile {
    /// Stable link to the original file.
    pub fn link(&self) -> String {
        match &self.web_view_link {
            Some(link) if !link.is_empty() => link.clone(),
            _ => format!("https://drive.google.com/file/d/{}/view", self.id),
        }
    }

    /// MIME type of the bytes `download` returns for this file.
    pub fn content_mime(&self) -> &str {
        if self.mime_type == GOOGLE_DOC_MIME {
            DOCX_MIME
        } else {
            &self.mime_type
        }
    }
}

pub trait DriveSource: Send + Sync {
    fn list_files(&self, folder_id: &str) -> Result<Vec<DriveFile>, DriveError>;

    fn download(&self, file: &DriveFile) -> Result<Vec<u8>, DriveError>;
}

/// Stand-in used when no credentials are configured.
pub struct UnconfiguredDrive {
    reason: String,
}

impl UnconfiguredDrive {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl DriveSource for UnconfiguredDrive {
    fn list_files(&self, _folder_id: &str) -> Result<Vec<DriveFile>, DriveError> {
        Err(DriveError::Unavailable(self.reason.clone()))
    }

    fn download(&self, _file: &DriveFile) -> Result<Vec<u8>, DriveError> {
        Err(DriveError::Unavailable(self.reason.clone()))
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Google Drive v3 client.
pub struct GoogleDrive {
    client: Client,
    key: ServiceAccountKey,
    token: Mutex<Option<CachedToken>>,
    api_base: String,
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

impl GoogleDrive {
    /// Must be called outside of an async runtime (blocking reqwest client).
    pub fn new(key: ServiceAccountKey, timeout: Duration) -> Result<Self, DriveError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            key,
            token: Mutex::new(None),
            api_base: DRIVE_API.to_string(),
        })
    }

    fn access_token(&self) -> Result<String, DriveError> {
        let mut cached = self
            .token
            .lock()
            .map_err(|_| DriveError::Auth("token lock poisoned".to_string()))?;

        if let Some(token) = cached.as_ref() {
            if Instant::now() + TOKEN_SLACK < token.expires_at {
                return Ok(token.value.clone());
            }
        }

        let assertion = self.signed_assertion(chrono::Utc::now().timestamp())?;
        let resp = self
            .client
            .post(&self.key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(DriveError::Auth(format!("token exchange failed ({status}): {body}")));
        }

        let token: TokenResponse = resp.json()?;
        log::debug!("obtained drive access token (expires in {}s)", token.expires_in);

        let value = token.access_token.clone();
        *cached = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    fn signed_assertion(&self, now: i64) -> Result<String, DriveError> {
        let claims = Claims {
            iss: &self.key.client_email,
            scope: DRIVE_SCOPE,
            aud: &self.key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .map_err(|e| DriveError::Auth(format!("invalid private key: {e}")))?;
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| DriveError::Auth(format!("failed to sign assertion: {e}")))
    }

    fn get(&self, url: &str, query: &[(&str, &str)]) -> Result<reqwest::blocking::Response, DriveError> {
        let token = self.access_token()?;
        let resp = self.client.get(url).bearer_auth(token).query(query).send()?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().unwrap_or_default();
            return Err(DriveError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }
}

fn folder_query(folder_id: &str) -> String {
    let escaped = folder_id.replace('\\', "\\\\").replace('\'', "\\'");
    format!("'{escaped}' in parents and trashed=false and mimeType != '{FOLDER_MIME}'")
}

impl DriveSource for GoogleDrive {
    fn list_files(&self, folder_id: &str) -> Result<Vec<DriveFile>, DriveError> {
        let url = format!("{}/files", self.api_base);
        let q = folder_query(folder_id);

        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut query = vec![
                ("q", q.as_str()),
                ("fields", "nextPageToken, files(id, name, mimeType, webViewLink)"),
                ("pageSize", PAGE_SIZE),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ];
            if let Some(token) = page_token.as_deref() {
                query.push(("pageToken", token));
            }

            let page: FileList = self.get(&url, &query)?.json()?;
            files.extend(page.files);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        log::info!("found {} file(s) in drive folder {folder_id}", files.len());
        Ok(files)
    }

    fn download(&self, file: &DriveFile) -> Result<Vec<u8>, DriveError> {
        let resp = if file.mime_type == GOOGLE_DOC_MIME {
            let url = format!("{}/files/{}/export", self.api_base, file.id);
            self.get(&url, &[("mimeType", DOCX_MIME)])?
        } else {
            let url = format!("{}/files/{}", self.api_base, file.id);
            self.get(&url, &[("alt", "media"), ("supportsAllDrives", "true")])?
        };

        Ok(resp.bytes()?.to_vec())
    }
}
