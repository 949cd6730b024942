#[cfg(test)]
mod tests;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use crate::{IndexError, Result};

/// Receives job progress so that another process can poll it.
#[async_trait]
pub trait StatusSink: Send + Sync {
    /// Start (or restart) tracking a job over `total` blocks.
    async fn new_embedding_status(&self, library: &str, model: &str, total: u64) -> Result<()>;

    async fn increment_embedding_status(&self, library: &str, model: &str, delta: u64)
    -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingStatus {
    pub library_name: String,
    pub embedding_model: String,
    pub total: u64,
    pub processed: u64,
    pub updated_at: String,
}

impl EmbeddingStatus {
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.processed >= self.total
    }
}

/// Job progress kept in a small SQLite file beside the configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingStatusStore {
    pool: SqlitePool,
}

impl EmbeddingStatusStore {
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| {
                IndexError::TextIndex(format!(
                    "Failed to open status database {}: {}",
                    path.display(),
                    e
                ))
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS embedding_status (
                library_name TEXT NOT NULL,
                embedding_model TEXT NOT NULL,
                total INTEGER NOT NULL DEFAULT 0,
                processed INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (library_name, embedding_model)
            )",
        )
        .execute(&pool)
        .await?;

        debug!("Opened embedding status store at {}", path.display());
        Ok(Self { pool })
    }

    pub async fn get_embedding_status(
        &self,
        library: &str,
        model: &str,
    ) -> Result<Option<EmbeddingStatus>> {
        let row = sqlx::query(
            "SELECT library_name, embedding_model, total, processed, updated_at
             FROM embedding_status WHERE library_name = ? AND embedding_model = ?",
        )
        .bind(library)
        .bind(model)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_status).transpose()
    }

    /// Every tracked job of `library`, most recently updated first.
    pub async fn list(&self, library: &str) -> Result<Vec<EmbeddingStatus>> {
        let rows = sqlx::query(
            "SELECT library_name, embedding_model, total, processed, updated_at
             FROM embedding_status WHERE library_name = ? ORDER BY updated_at DESC",
        )
        .bind(library)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_status).collect()
    }
}

fn decode_status(row: &SqliteRow) -> Result<EmbeddingStatus> {
    let count = |column: &str| -> Result<u64> {
        let value: i64 = row.try_get(column)?;
        Ok(u64::try_from(value).unwrap_or_default())
    };

    Ok(EmbeddingStatus {
        library_name: row.try_get("library_name")?,
        embedding_model: row.try_get("embedding_model")?,
        total: count("total")?,
        processed: count("processed")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[async_trait]
impl StatusSink for EmbeddingStatusStore {
    async fn new_embedding_status(&self, library: &str, model: &str, total: u64) -> Result<()> {
        sqlx::query(
            "INSERT INTO embedding_status (library_name, embedding_model, total, processed, updated_at)
             VALUES (?, ?, ?, 0, ?)
             ON CONFLICT (library_name, embedding_model)
             DO UPDATE SET total = excluded.total, processed = 0, updated_at = excluded.updated_at",
        )
        .bind(library)
        .bind(model)
        .bind(to_sql_count(total))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment_embedding_status(
        &self,
        library: &str,
        model: &str,
        delta: u64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE embedding_status SET processed = processed + ?, updated_at = ?
             WHERE library_name = ? AND embedding_model = ?",
        )
        .bind(to_sql_count(delta))
        .bind(Utc::now().to_rfc3339())
        .bind(library)
        .bind(model)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(IndexError::TextIndex(format!(
                "No embedding status for {}/{}",
                library, model
            )));
        }
        Ok(())
    }
}
