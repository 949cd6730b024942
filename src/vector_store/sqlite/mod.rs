
use async_trait::async_trait;
use futures::TryStreamExt;
use futures::future::{BoxFuture, FutureExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{EmbeddedBlock, EngineContext, VectorHit, VectorStore};
use crate::text_index::schema::quote_ident;
use crate::{IndexError, Result};

/// Vectors as little-endian `f32` blobs in a local SQLite file, searched by brute force.
pub struct SqliteVectorStore {
    pool: SqlitePool,
    table_name: String,
    dims: u32,
}

impl SqliteVectorStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::connect(&context).await?);
            Ok(store)
        }
        .boxed()
    }

    pub async fn connect(context: &EngineContext) -> Result<Self> {
        std::fs::create_dir_all(&context.vector_dir)?;
        let path = context.vector_dir.join("vectors.db");

        let options = SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| {
                IndexError::VectorStore(format!(
                    "Failed to open SQLite vector file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        debug!("Opened SQLite vector store at {}", path.display());
        Ok(Self {
            pool,
            table_name: context.index_name("sqlite"),
            dims: context.dims,
        })
    }

    async fn table_exists(&self) -> Result<bool> {
        let found = sqlx::query("SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(&self.table_name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }
}

fn encode_vector(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let (dot, norm_a, norm_b) = a
        .iter()
        .zip(b)
        .fold((0.0f32, 0.0f32, 0.0f32), |(dot, na, nb), (x, y)| {
            (dot + x * y, na + x * x, nb + y * y)
        });
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn engine_name(&self) -> &'static str {
        "sqlite"
    }

    fn collection_name(&self) -> &str {
        &self.table_name
    }

    async fn ensure_index(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                block_id TEXT PRIMARY KEY,
                doc_id INTEGER NOT NULL,
                embedding BLOB NOT NULL
            )",
            quote_ident(&self.table_name)
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (block_id, doc_id, embedding) VALUES (?, ?, ?)
             ON CONFLICT (block_id) DO UPDATE SET doc_id = excluded.doc_id, embedding = excluded.embedding",
            quote_ident(&self.table_name)
        );

        let mut tx = self.pool.begin().await?;
        for entry in batch {
            if entry.vector.len() != self.dims as usize {
                return Err(IndexError::Embedding(format!(
                    "Vector for block {} has {} dimensions, expected {}",
                    entry.id,
                    entry.vector.len(),
                    self.dims
                )));
            }
            sqlx::query(&sql)
                .bind(&entry.id)
                .bind(entry.doc_id)
                .bind(encode_vector(&entry.vector))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }

        let sql = format!(
            "SELECT block_id, embedding FROM {}",
            quote_ident(&self.table_name)
        );
        let mut rows = sqlx::query(&sql).fetch(&self.pool);
        let mut hits = Vec::new();
        while let Some(row) = rows.try_next().await? {
            let id: String = row.try_get("block_id")?;
            let bytes: Vec<u8> = row.try_get("embedding")?;
            let similarity = cosine_similarity(vector, &decode_vector(&bytes));
            hits.push(VectorHit::from_score(id, similarity));
        }

        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    async fn delete_index(&self) -> Result<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", quote_ident(&self.table_name));
        sqlx::query(&sql).execute(&self.pool).await?;
        info!("Dropped SQLite vector table {}", self.table_name);
        Ok(())
    }
}
