
use std::sync::Arc;
use tracing::{info, warn};

use super::naming;
use super::{EmbeddingModel, EmbeddingSummary, EmbeddingUtilities, StatusSink};
use crate::library::Library;
use crate::text_index::{Block, EmbeddingRecord};
use crate::vector_store::{EngineRegistry, VectorStore};
use crate::{IndexError, Result};

/// A query as callers hand it over: one vector, or a batch that must hold exactly one.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryVector {
    Single(Vec<f32>),
    Batch(Vec<Vec<f32>>),
}

impl QueryVector {
    /// Unwrap a length-1 batch. Any other batch size is rejected.
    pub fn into_single(self) -> Result<Vec<f32>> {
        match self {
            Self::Single(vector) => Ok(vector),
            Self::Batch(mut batch) if batch.len() == 1 => Ok(batch.remove(0)),
            Self::Batch(batch) => Err(IndexError::Config(format!(
                "Search takes one query vector, got a batch of {}",
                batch.len()
            ))),
        }
    }
}

impl From<Vec<f32>> for QueryVector {
    fn from(vector: Vec<f32>) -> Self {
        Self::Single(vector)
    }
}

impl From<Vec<Vec<f32>>> for QueryVector {
    fn from(batch: Vec<Vec<f32>>) -> Self {
        Self::Batch(batch)
    }
}

/// Entry point for embedding jobs, searches and deletes on one library.
pub struct EmbeddingHandler {
    library: Library,
    status: Arc<dyn StatusSink>,
    registry: EngineRegistry,
}

impl EmbeddingHandler {
    #[inline]
    pub fn new(library: Library, status: Arc<dyn StatusSink>) -> Self {
        Self {
            library,
            status,
            registry: EngineRegistry::with_default_engines(),
        }
    }

    #[inline]
    pub fn with_registry(mut self, registry: EngineRegistry) -> Self {
        self.registry = registry;
        self
    }

    #[inline]
    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Check the engine and model before any connection is made, then open the engine.
    async fn prepare(
        &self,
        engine: &str,
        model_name: &str,
        dims: u32,
    ) -> Result<(Arc<dyn VectorStore>, EmbeddingUtilities)> {
        let constructor = self.registry.resolve(engine)?;
        let utilities = EmbeddingUtilities::new(self.library.index(), engine, model_name)?;
        let store = constructor(self.library.engine_context(model_name, dims)).await?;
        Ok((store, utilities))
    }

    /// Embed the library's unflagged blocks (or every block of `doc_ids`) into `engine`.
    ///
    /// The library card's ledger is updated only when something was embedded.
    pub async fn create_new_embedding(
        &self,
        engine: &str,
        model: &dyn EmbeddingModel,
        doc_ids: Option<&[i64]>,
        batch_size: usize,
    ) -> Result<EmbeddingSummary> {
        let dims = model.embedding_dims();
        let (store, utilities) = self.prepare(engine, model.model_name(), dims).await?;

        let summary = store
            .create_new_embedding(&utilities, model, self.status.as_ref(), doc_ids, batch_size)
            .await?;

        if summary.embeddings_created > 0 {
            self.library
                .update_embedding_status(
                    EmbeddingRecord::completed(
                        model.model_name(),
                        engine,
                        dims,
                        summary.embedded_blocks,
                    ),
                    false,
                )
                .await?;
        }

        info!(
            "Embedding job {}/{} on {}: {} created, {} embedded in total",
            engine,
            model.model_name(),
            self.library.library_name(),
            summary.embeddings_created,
            summary.embedded_blocks
        );
        Ok(summary)
    }

    /// The `k` blocks nearest to `query`, closest first.
    pub async fn search_index(
        &self,
        query: impl Into<QueryVector>,
        engine: &str,
        model_name: &str,
        k: usize,
    ) -> Result<Vec<(Block, f32)>> {
        let vector = query.into().into_single()?;
        let dims = u32::try_from(vector.len())
            .map_err(|_| IndexError::Config("Query vector is too long".to_string()))?;
        let (store, utilities) = self.prepare(engine, model_name, dims).await?;
        store.search_index(&utilities, &vector, k).await
    }

    /// Drop the engine's index, then clear the flags, then remove the ledger entry.
    ///
    /// Each step is idempotent, so a delete that failed half way is repaired by
    /// running it again. Returns how many blocks were unflagged.
    pub async fn delete_index(&self, engine: &str, model_name: &str, dims: u32) -> Result<u64> {
        let (store, utilities) = self.prepare(engine, model_name, dims).await?;

        store.delete_index().await?;
        let unflagged = utilities.unset_text_index().await?;
        if unflagged == 0 {
            warn!(
                "No blocks of {} were flagged for {}/{}",
                self.library.library_name(),
                engine,
                model_name
            );
        }

        self.library
            .update_embedding_status(EmbeddingRecord::completed(model_name, engine, dims, 0), true)
            .await?;
        info!(
            "Deleted {} index for {} on {}",
            engine,
            model_name,
            self.library.library_name()
        );
        Ok(unflagged)
    }

    #[inline]
    pub fn generate_index_name(account: &str, library: &str, model: &str) -> String {
        naming::generate_index_name(account, library, model)
    }
}
