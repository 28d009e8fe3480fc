use crate::semantic::{EmbeddingError, RebuildError};

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Rebuild(#[from] RebuildError),

    #[error(transparent)]
    Embedding(#[from] EmbeddingError),

    #[error("invalid request: {0}")]
    BadRequest(String),

    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("unexpected error: {0:?}")]
    Other(#[from] anyhow::Error),
}
