// Vector store module
// One contract for the ten engines, the name-to-constructor registry, and the
// scan-embed-upsert-flag loop every engine shares.

pub mod chroma;
pub mod hnsw;
pub mod lancedb;
pub mod milvus;
pub mod neo4j;
pub mod pgvector;
pub mod pinecone;
pub mod qdrant;
pub mod rest;
pub mod sqlite;
pub mod weaviate;


use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{Config, VectorStoreConfig};
use crate::embedding::naming;
use crate::embedding::{EmbeddingModel, EmbeddingSummary, EmbeddingUtilities, StatusSink};
use crate::text_index::Block;
use crate::{IndexError, Result};

pub const ENGINE_NAMES: &[&str] = &[
    "lancedb", "sqlite", "pgvector", "hnsw", "qdrant", "milvus", "chroma", "pinecone", "neo4j",
    "weaviate",
];

/// How an engine marks a block as embedded in the text index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagStrategy {
    /// The token is the flag key itself; hits carry the block `_id`.
    KeyToken,
    /// The token is the entry's position in the engine; hits carry that position.
    Sequential,
}

/// One block ready to be written to an engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedBlock {
    pub id: String,
    pub doc_id: i64,
    /// Position assigned to this entry. Only meaningful for sequential engines.
    pub position: i64,
    pub text: String,
    pub vector: Vec<f32>,
}

/// How a nearest-neighbour hit points back at its block.
#[derive(Debug, Clone, PartialEq)]
pub enum HitKey {
    Id(String),
    Position(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorHit {
    pub key: HitKey,
    /// Smaller is closer
    pub distance: f32,
}

impl VectorHit {
    #[inline]
    pub fn id(id: impl Into<String>, distance: f32) -> Self {
        Self {
            key: HitKey::Id(id.into()),
            distance,
        }
    }

    /// Hit from an engine that reports similarity scores.
    #[inline]
    pub fn from_score(id: impl Into<String>, score: f32) -> Self {
        Self::id(id, 1.0 - score)
    }
}

/// Everything an engine needs to attach to its index for one library and model.
#[derive(Debug, Clone)]
pub struct EngineContext {
    pub account_name: String,
    pub library_name: String,
    pub model_name: String,
    pub dims: u32,
    /// Local directory for embedded engines, one per library
    pub vector_dir: PathBuf,
    pub pgvector_url: String,
    pub settings: VectorStoreConfig,
}

impl EngineContext {
    #[inline]
    pub fn from_config(config: &Config, library_name: &str, model_name: &str, dims: u32) -> Self {
        Self {
            account_name: config.account_name.clone(),
            library_name: library_name.to_string(),
            model_name: model_name.to_string(),
            dims,
            vector_dir: config
                .vector_dir()
                .join(&config.account_name)
                .join(library_name),
            pgvector_url: config.pgvector_url().to_string(),
            settings: config.vector_store.clone(),
        }
    }

    /// Collection name for `engine`, normalized the way that engine requires.
    #[inline]
    pub fn index_name(&self, engine: &str) -> String {
        naming::engine_index_name(
            engine,
            &self.account_name,
            &self.library_name,
            &self.model_name,
        )
    }
}

/// One vector engine bound to one collection.
///
/// Engines implement the storage primitives; the job loop, reverse lookup and
/// ordering of results are shared.
#[async_trait]
pub trait VectorStore: Send + Sync {
    fn engine_name(&self) -> &'static str;

    fn collection_name(&self) -> &str;

    fn flag_strategy(&self) -> FlagStrategy {
        FlagStrategy::KeyToken
    }

    /// Create the collection if absent, otherwise attach to it.
    async fn ensure_index(&self) -> Result<()>;

    /// First free position for a sequential engine.
    async fn next_position(&self) -> Result<i64> {
        Ok(0)
    }

    /// Insert or overwrite `batch`, keyed by block `_id`.
    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()>;

    /// Runs once after the last batch of a job.
    async fn finish_job(&self, _summary: &EmbeddingSummary) -> Result<()> {
        Ok(())
    }

    /// The `k` nearest entries, closest first.
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>>;

    /// Drop the collection. Dropping a missing collection succeeds.
    async fn delete_index(&self) -> Result<()>;

    /// Embed every block the job cursor yields, one batch at a time.
    ///
    /// Each batch is upserted before its blocks are flagged, so an interrupted job can
    /// be rerun and only re-embeds what was never flagged.
    async fn create_new_embedding(
        &self,
        utilities: &EmbeddingUtilities,
        model: &dyn EmbeddingModel,
        status: &dyn StatusSink,
        doc_ids: Option<&[i64]>,
        batch_size: usize,
    ) -> Result<EmbeddingSummary> {
        let batch_size = batch_size.max(1);
        let (total, mut cursor) = utilities.get_blocks_cursor(doc_ids).await?;
        info!(
            "Embedding {} blocks of {} into {} {}",
            total,
            utilities.library_name(),
            self.engine_name(),
            self.collection_name()
        );

        status
            .new_embedding_status(utilities.library_name(), utilities.model_name(), total)
            .await?;
        self.ensure_index().await?;

        let mut position = self.next_position().await?;
        let mut created = 0u64;
        loop {
            let batch = cursor.pull_batch(batch_size).await?;
            if batch.is_empty() {
                break;
            }

            let pending: Vec<&Block> = batch
                .iter()
                .filter(|block| !block.text_search().trim().is_empty())
                .collect();

            if !pending.is_empty() {
                let texts: Vec<String> = pending
                    .iter()
                    .map(|block| block.text_search().to_string())
                    .collect();
                let vectors = model.embedding(&texts).await?;
                if vectors.len() != texts.len() {
                    return Err(IndexError::Embedding(format!(
                        "Model returned {} vectors for {} texts",
                        vectors.len(),
                        texts.len()
                    )));
                }

                let embedded: Vec<EmbeddedBlock> = pending
                    .iter()
                    .zip(texts)
                    .zip(vectors)
                    .enumerate()
                    .map(|(offset, ((block, text), vector))| EmbeddedBlock {
                        id: block.id().to_string(),
                        doc_id: block.doc_id().unwrap_or_default(),
                        position: position + offset as i64,
                        text,
                        vector,
                    })
                    .collect();

                self.upsert(&embedded).await?;
                let ids: Vec<String> = embedded.iter().map(|e| e.id.clone()).collect();
                position = utilities
                    .update_text_index(&ids, self.flag_strategy(), position)
                    .await?;
                created += embedded.len() as u64;
            }

            status
                .increment_embedding_status(
                    utilities.library_name(),
                    utilities.model_name(),
                    batch.len() as u64,
                )
                .await?;
            debug!(
                "Batch done: {} blocks, {} embedded so far",
                batch.len(),
                created
            );
        }

        let summary = utilities
            .generate_embedding_summary(created, model.embedding_dims())
            .await?;
        self.finish_job(&summary).await?;
        Ok(summary)
    }

    /// Nearest blocks to `vector`, each paired with its distance, closest first.
    ///
    /// Hits whose block is gone from the text index are skipped. Sequential engines
    /// keep superseded positions after a re-embed, so for them the query widens
    /// until `k` live blocks are found or the engine runs out of entries.
    async fn search_index(
        &self,
        utilities: &EmbeddingUtilities,
        vector: &[f32],
        k: usize,
    ) -> Result<Vec<(Block, f32)>> {
        let widen = self.flag_strategy() == FlagStrategy::Sequential;
        let mut fetch = k;
        loop {
            let hits = self.query(vector, fetch).await?;
            let exhausted = hits.len() < fetch;
            let mut results = Vec::with_capacity(hits.len());
            let mut stale = Vec::new();

            for hit in hits {
                let block = match &hit.key {
                    HitKey::Id(id) => utilities.lookup_text_index(id).await?,
                    HitKey::Position(position) => {
                        utilities.lookup_embedding_flag(*position).await?
                    }
                };
                match block {
                    Some(block) => results.push((block, hit.distance)),
                    None => stale.push(hit.key),
                }
            }

            if widen && results.len() < k && !exhausted && !stale.is_empty() {
                debug!(
                    "{} returned {} stale hits of {}; widening",
                    self.engine_name(),
                    stale.len(),
                    fetch
                );
                fetch = fetch.saturating_mul(2);
                continue;
            }

            for key in &stale {
                warn!(
                    "{} hit {:?} has no block in {}",
                    self.engine_name(),
                    key,
                    utilities.library_name()
                );
            }
            results.sort_by(|a, b| a.1.total_cmp(&b.1));
            results.truncate(k);
            return Ok(results);
        }
    }
}

/// Stable UUID for a block `_id`, for engines whose point ids must be UUIDs.
#[inline]
pub fn point_uuid(block_id: &str) -> uuid::Uuid {
    uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, block_id.as_bytes())
}

pub type EngineConstructor = fn(EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>>;

/// Engine name to constructor. Adding an engine means registering one more entry.
#[derive(Clone, Default)]
pub struct EngineRegistry {
    constructors: BTreeMap<String, EngineConstructor>,
}

impl EngineRegistry {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding all ten built-in engines.
    pub fn with_default_engines() -> Self {
        let mut registry = Self::new();
        registry.register("lancedb", lancedb::LanceDbStore::open);
        registry.register("sqlite", sqlite::SqliteVectorStore::open);
        registry.register("pgvector", pgvector::PgVectorStore::open);
        registry.register("hnsw", hnsw::HnswStore::open);
        registry.register("qdrant", qdrant::QdrantStore::open);
        registry.register("milvus", milvus::MilvusStore::open);
        registry.register("chroma", chroma::ChromaStore::open);
        registry.register("pinecone", pinecone::PineconeStore::open);
        registry.register("neo4j", neo4j::Neo4jStore::open);
        registry.register("weaviate", weaviate::WeaviateStore::open);
        registry
    }

    #[inline]
    pub fn register(&mut self, name: &str, constructor: EngineConstructor) {
        self.constructors.insert(name.to_string(), constructor);
    }

    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(name)
    }

    #[inline]
    pub fn names(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }

    /// Fails with a configuration error, before any connection is made, when
    /// `name` is not registered.
    #[inline]
    pub fn resolve(&self, name: &str) -> Result<EngineConstructor> {
        self.constructors
            .get(name)
            .copied()
            .ok_or_else(|| IndexError::UnknownEngine(name.to_string()))
    }

    pub async fn open(&self, name: &str, context: EngineContext) -> Result<Arc<dyn VectorStore>> {
        let constructor = self.resolve(name)?;
        debug!(
            "Opening {} engine for {}/{}",
            name, context.library_name, context.model_name
        );
        constructor(context).await
    }
}
