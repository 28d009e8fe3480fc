//! PostgreSQL chunk store.
//!
//! One table holds the current generation. Embeddings are stored as JSONB
//! arrays next to the name of the model that produced them. Replacement runs
//! `DELETE` + `INSERT` inside a single transaction, so readers only ever see
//! a complete generation.
//!
//! The rest of the crate is synchronous; the store owns a small private tokio
//! runtime and blocks on it for each operation.

use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use tokio::runtime::Runtime;
use tokio_postgres::types::Json;
use tokio_postgres::{Client, NoTls};

use super::{ChunkStore, StoreError};
use crate::semantic::record::ChunkRecord;

pub struct PgChunkStore {
    runtime: Option<Runtime>,
    client: Mutex<Client>,
    table: String,
    model: String,
}

impl PgChunkStore {
    /// Connect and make sure the table exists.
    ///
    /// Must be called outside of an async runtime.
    pub fn connect(database_url: &str, table: &str, model: &str) -> Result<Self, StoreError> {
        validate_table_name(table)?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("docsift-pg")
            .enable_all()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to start runtime: {e}")))?;

        let client = runtime.block_on(async {
            let (client, connection) = tokio_postgres::connect(database_url, NoTls)
                .await
                .map_err(unavailable)?;
            tokio::spawn(async move {
                if let Err(err) = connection.await {
                    log::error!("postgres connection error: {err}");
                }
            });
            ensure_table(&client, table).await?;
            Ok::<_, StoreError>(client)
        })?;

        log::info!("connected to postgres chunk store (table {table})");

        Ok(Self {
            runtime: Some(runtime),
            client: Mutex::new(client),
            table: table.to_string(),
            model: model.to_string(),
        })
    }

    fn parts(&self) -> Result<(&Runtime, MutexGuard<'_, Client>), StoreError> {
        let runtime = self
            .runtime
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("runtime shut down".to_string()))?;
        let client = self
            .client
            .lock()
            .map_err(|_| StoreError::Unavailable("postgres client lock poisoned".to_string()))?;
        Ok((runtime, client))
    }
}

impl Drop for PgChunkStore {
    fn drop(&mut self) {
        // may be dropped from inside the HTTP runtime
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl ChunkStore for PgChunkStore {
    fn kind(&self) -> &'static str {
        "postgres"
    }

    fn load_all(&self) -> Result<Vec<ChunkRecord>, StoreError> {
        let sql = format!(
            "SELECT chunk_id, text, embedding, source_document, source_link, \
                chunk_index, total_chunks, folder_id, created_at, embedding_model \
             FROM {} ORDER BY position",
            self.table
        );
        let (runtime, client) = self.parts()?;

        runtime.block_on(async {
            let rows = client.query(&sql, &[]).await.map_err(unavailable)?;

            let mut records = Vec::with_capacity(rows.len());
            for row in rows {
                let row_model: String = row.try_get(9).map_err(corrupted)?;
                if row_model != self.model {
                    return Err(StoreError::ModelMismatch);
                }

                let Json(embedding): Json<Vec<f32>> = row.try_get(2).map_err(corrupted)?;
                let chunk_index: i32 = row.try_get(5).map_err(corrupted)?;
                let total_chunks: i32 = row.try_get(6).map_err(corrupted)?;
                let created_at: DateTime<Utc> = row.try_get(8).map_err(corrupted)?;

                records.push(ChunkRecord {
                    chunk_id: row.try_get(0).map_err(corrupted)?,
                    text: row.try_get(1).map_err(corrupted)?,
                    embedding,
                    source_document: row.try_get(3).map_err(corrupted)?,
                    source_link: row.try_get(4).map_err(corrupted)?,
                    chunk_index: to_usize(chunk_index)?,
                    total_chunks: to_usize(total_chunks)?,
                    folder_id: row.try_get(7).map_err(corrupted)?,
                    created_at,
                });
            }
            Ok(records)
        })
    }

    fn replace_all(&self, records: &[ChunkRecord]) -> Result<(), StoreError> {
        let delete = format!("DELETE FROM {}", self.table);
        let insert = format!(
            "INSERT INTO {} \
                (chunk_id, text, embedding, source_document, source_link, chunk_index, \
                 total_chunks, folder_id, created_at, embedding_model, position) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            self.table
        );
        let (runtime, mut client) = self.parts()?;

        runtime.block_on(async {
            let transaction = client.transaction().await.map_err(unavailable)?;
            transaction.execute(&delete, &[]).await.map_err(unavailable)?;

            let statement = transaction.prepare(&insert).await.map_err(unavailable)?;
            for (position, record) in records.iter().enumerate() {
                let embedding = Json(&record.embedding);
                let chunk_index = to_i32(record.chunk_index)?;
                let total_chunks = to_i32(record.total_chunks)?;
                let position = position as i64;
                transaction
                    .execute(
                        &statement,
                        &[
                            &record.chunk_id,
                            &record.text,
                            &embedding,
                            &record.source_document,
                            &record.source_link,
                            &chunk_index,
                            &total_chunks,
                            &record.folder_id,
                            &record.created_at,
                            &self.model,
                            &position,
                        ],
                    )
                    .await
                    .map_err(|e| {
                        StoreError::Unavailable(format!(
                            "failed to insert chunk {}: {e}",
                            record.chunk_id
                        ))
                    })?;
            }

            transaction.commit().await.map_err(unavailable)?;
            Ok(())
        })
    }

    fn count(&self) -> Result<usize, StoreError> {
        let sql = format!("SELECT COUNT(*) FROM {}", self.table);
        let (runtime, client) = self.parts()?;
        runtime.block_on(async {
            let row = client.query_one(&sql, &[]).await.map_err(unavailable)?;
            let count: i64 = row.try_get(0).map_err(corrupted)?;
            Ok(count.max(0) as usize)
        })
    }

    fn clear(&self) -> Result<(), StoreError> {
        let sql = format!("DELETE FROM {}", self.table);
        let (runtime, client) = self.parts()?;
        runtime.block_on(async {
            client.execute(&sql, &[]).await.map_err(unavailable)?;
            Ok(())
        })
    }
}

async fn ensure_table(client: &Client, table: &str) -> Result<(), StoreError> {
    let ddl = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            chunk_id TEXT PRIMARY KEY,
            text TEXT NOT NULL,
            embedding JSONB NOT NULL,
            source_document TEXT NOT NULL,
            source_link TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            total_chunks INTEGER NOT NULL,
            folder_id TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            embedding_model TEXT NOT NULL,
            position BIGINT NOT NULL
        )"
    );
    client.execute(&ddl, &[]).await.map_err(unavailable)?;
    Ok(())
}

/// Accepts `name` or `schema.name` made of ASCII letters, digits and underscores.
fn validate_table_name(table: &str) -> Result<(), StoreError> {
    let valid = !table.is_empty()
        && table.split('.').count() <= 2
        && table.split('.').all(|part| {
            !part.is_empty()
                && !part.starts_with(|c: char| c.is_ascii_digit())
                && part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });

    if valid {
        Ok(())
    } else {
        Err(StoreError::Unavailable(format!("invalid table name: {table:?}")))
    }
}

fn unavailable(err: tokio_postgres::Error) -> StoreError {
    StoreError::Unavailable(err.to_string())
}

fn corrupted(err: tokio_postgres::Error) -> StoreError {
    StoreError::Corrupted(err.to_string())
}

fn to_i32(value: usize) -> Result<i32, StoreError> {
    i32::try_from(value)
        .map_err(|_| StoreError::Corrupted(format!("value {value} exceeds INTEGER range")))
}

fn to_usize(value: i32) -> Result<usize, StoreError> {
    usize::try_from(value).map_err(|_| StoreError::Corrupted(format!("negative value {value}")))
}
