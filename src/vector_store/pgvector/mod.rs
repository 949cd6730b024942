
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use pgvector::Vector;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::{EmbeddedBlock, EngineContext, VectorHit, VectorStore};
use crate::embedding::EmbeddingSummary;
use crate::embedding::naming::{MAX_INDEX_NAME_LEN, derive_name};
use crate::text_index::schema::quote_ident;
use crate::{IndexError, Result};

const BLOCKS_PER_LIST: u64 = 1000;
const MAX_LISTS: u64 = 1000;

/// Number of IVFFlat lists for a table holding `embedded_blocks` rows.
#[inline]
pub fn ivfflat_lists(embedded_blocks: u64) -> u64 {
    (embedded_blocks / BLOCKS_PER_LIST).clamp(1, MAX_LISTS)
}

/// Postgres table with a `vector(dims)` column and a cosine IVFFlat index.
///
/// IVFFlat clusters existing rows, so the index is built after data is written and
/// rebuilt at the end of every job.
pub struct PgVectorStore {
    pool: PgPool,
    table_name: String,
    dims: u32,
}

impl PgVectorStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::connect(&context).await?);
            Ok(store)
        }
        .boxed()
    }

    pub async fn connect(context: &EngineContext) -> Result<Self> {
        if context.pgvector_url.trim().is_empty() {
            return Err(IndexError::Config(
                "The pgvector engine needs vector_store.postgres.url or text_index.postgres_url"
                    .to_string(),
            ));
        }

        let pool = PgPoolOptions::new()
            .max_connections(2)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&context.pgvector_url)
            .await
            .map_err(|e| IndexError::VectorStore(format!("Failed to connect to pgvector: {}", e)))?;

        Ok(Self {
            pool,
            table_name: context.index_name("pgvector"),
            dims: context.dims,
        })
    }

    fn table(&self) -> String {
        quote_ident(&self.table_name)
    }

    fn ann_index_name(&self) -> String {
        derive_name(&[&self.table_name, "ivfflat"], MAX_INDEX_NAME_LEN, '_')
    }

    async fn table_exists(&self) -> Result<bool> {
        let row = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS present")
            .bind(self.table())
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("present")?)
    }

    /// Drop and recreate the IVFFlat index sized for the current row count.
    pub async fn rebuild_ann_index(&self, embedded_blocks: u64) -> Result<()> {
        let lists = ivfflat_lists(embedded_blocks);
        let index = quote_ident(&self.ann_index_name());

        sqlx::query(&format!("DROP INDEX IF EXISTS {}", index))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE INDEX {} ON {} USING ivfflat (embedding vector_cosine_ops) WITH (lists = {})",
            index,
            self.table(),
            lists
        ))
        .execute(&self.pool)
        .await?;

        info!(
            "Built IVFFlat index on {} with {} lists",
            self.table_name, lists
        );
        Ok(())
    }
}

#[async_trait]
impl VectorStore for PgVectorStore {
    fn engine_name(&self) -> &'static str {
        "pgvector"
    }

    fn collection_name(&self) -> &str {
        &self.table_name
    }

    async fn ensure_index(&self) -> Result<()> {
        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {} (
                block_id TEXT PRIMARY KEY,
                doc_id BIGINT NOT NULL,
                embedding vector({}) NOT NULL
            )",
            self.table(),
            self.dims
        ))
        .execute(&self.pool)
        .await?;
        debug!("pgvector table {} ready", self.table_name);
        Ok(())
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        let sql = format!(
            "INSERT INTO {} (block_id, doc_id, embedding) VALUES ($1, $2, $3)
             ON CONFLICT (block_id) DO UPDATE SET doc_id = EXCLUDED.doc_id, embedding = EXCLUDED.embedding",
            self.table()
        );

        let mut tx = self.pool.begin().await?;
        for entry in batch {
            sqlx::query(&sql)
                .bind(&entry.id)
                .bind(entry.doc_id)
                .bind(Vector::from(entry.vector.clone()))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn finish_job(&self, summary: &EmbeddingSummary) -> Result<()> {
        if summary.embedded_blocks == 0 {
            return Ok(());
        }
        self.rebuild_ann_index(summary.embedded_blocks).await
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(&format!(
            "SELECT block_id, (embedding <=> $1)::real AS distance
             FROM {} ORDER BY embedding <=> $1 LIMIT $2",
            self.table()
        ))
        .bind(Vector::from(vector.to_vec()))
        .bind(i64::try_from(k).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<VectorHit> {
                let id: String = row.try_get("block_id")?;
                let distance: f32 = row.try_get("distance")?;
                Ok(VectorHit::id(id, distance))
            })
            .collect()
    }

    async fn delete_index(&self) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table()))
            .execute(&self.pool)
            .await?;
        info!("Dropped pgvector table {}", self.table_name);
        Ok(())
    }
}
