#[cfg(test)]
mod tests;

use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::EmbeddingSummary;
use super::naming;
use crate::text_index::{
    Block, CollectionRetrieval, CollectionWriter, Cursor, TextIndex, schema,
};
use crate::vector_store::FlagStrategy;
use crate::{IndexError, Result};

/// Text-index side of one (library, engine, model) embedding.
///
/// Engines read source blocks through this, write completion flags back, and turn
/// vector hits into blocks again.
#[derive(Clone)]
pub struct EmbeddingUtilities {
    account_name: String,
    retrieval: CollectionRetrieval,
    writer: CollectionWriter,
    engine: String,
    model_name: String,
    flag_key: String,
}

impl EmbeddingUtilities {
    pub fn new(index: Arc<dyn TextIndex>, engine: &str, model_name: &str) -> Result<Self> {
        if model_name.trim().is_empty() {
            return Err(IndexError::MissingModel);
        }

        Ok(Self {
            account_name: index.account_name().to_string(),
            retrieval: CollectionRetrieval::new(Arc::clone(&index)),
            writer: CollectionWriter::new(index),
            engine: engine.to_string(),
            model_name: model_name.to_string(),
            flag_key: naming::flag_key(engine, model_name),
        })
    }

    #[inline]
    pub fn library_name(&self) -> &str {
        self.retrieval.collection_name()
    }

    #[inline]
    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    #[inline]
    pub fn engine(&self) -> &str {
        &self.engine
    }

    #[inline]
    pub fn model_name(&self) -> &str {
        &self.model_name
    }

    #[inline]
    pub fn flag_key(&self) -> &str {
        &self.flag_key
    }

    /// Blocks still to embed, or every block of `doc_ids` when given.
    #[inline]
    pub async fn get_blocks_cursor(&self, doc_ids: Option<&[i64]>) -> Result<(u64, Cursor)> {
        self.retrieval
            .embedding_job_cursor(&self.flag_key, doc_ids)
            .await
    }

    /// Flag `block_ids` as embedded, in order, starting at position `start_index`.
    ///
    /// Returns the next free position.
    pub async fn update_text_index(
        &self,
        block_ids: &[String],
        strategy: FlagStrategy,
        start_index: i64,
    ) -> Result<i64> {
        let flags: Vec<(String, Value)> = block_ids
            .iter()
            .zip(start_index..)
            .map(|(id, position)| {
                let token = match strategy {
                    FlagStrategy::KeyToken => Value::from(self.flag_key.as_str()),
                    FlagStrategy::Sequential => Value::from(position),
                };
                (id.clone(), token)
            })
            .collect();
        self.writer
            .add_embedding_flags(&self.flag_key, &flags)
            .await?;
        let next = start_index + block_ids.len() as i64;

        debug!(
            "Flagged {} blocks with {} (next index {})",
            block_ids.len(),
            self.flag_key,
            next
        );
        Ok(next)
    }

    /// The block a vector entry keyed by block `_id` points at.
    ///
    /// An id that cannot be a key of this backend names no block.
    pub async fn lookup_text_index(&self, id: &str) -> Result<Option<Block>> {
        if self.retrieval.backend().is_relational() && schema::parse_row_id(id).is_err() {
            warn!(
                "Vector entry {} is not a block key of {}",
                id,
                self.library_name()
            );
            return Ok(None);
        }
        Ok(self.retrieval.lookup("_id", id).await?.into_iter().next())
    }

    /// The block a vector entry keyed by sequential position points at.
    #[inline]
    pub async fn lookup_embedding_flag(&self, position: i64) -> Result<Option<Block>> {
        self.retrieval
            .lookup_embedding_flag(&self.flag_key, &Value::from(position))
            .await
    }

    #[inline]
    pub async fn count_embedded_blocks(&self) -> Result<u64> {
        self.retrieval.count_embedded_blocks(&self.flag_key).await
    }

    pub async fn generate_embedding_summary(
        &self,
        embeddings_created: u64,
        embedding_dims: u32,
    ) -> Result<EmbeddingSummary> {
        let embedded_blocks = self.count_embedded_blocks().await?;
        info!(
            "{} embeddings created for {} with {}/{}; {} blocks embedded in total",
            embeddings_created,
            self.library_name(),
            self.engine,
            self.model_name,
            embedded_blocks
        );
        Ok(EmbeddingSummary::new(
            embeddings_created,
            embedded_blocks,
            embedding_dims,
        ))
    }

    /// Remove this embedding's flag from every block.
    #[inline]
    pub async fn unset_text_index(&self) -> Result<u64> {
        self.writer.unset_embedding_flag(&self.flag_key).await
    }
}
