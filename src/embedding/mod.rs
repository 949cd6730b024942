// Embedding module
// The model capability, naming of vector collections and flag keys, the job
// utilities shared by every engine, progress status, and the handler facade.

pub mod handler;
pub mod naming;
pub mod ollama;
pub mod status;
pub mod utilities;


use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::Result;

pub use handler::{EmbeddingHandler, QueryVector};
pub use naming::{flag_key, generate_index_name};
pub use ollama::OllamaClient;
pub use status::{EmbeddingStatus, EmbeddingStatusStore, StatusSink};
pub use utilities::EmbeddingUtilities;

/// An embedding model with a fixed output dimension.
#[async_trait]
pub trait EmbeddingModel: Send + Sync {
    fn model_name(&self) -> &str;

    fn embedding_dims(&self) -> u32;

    /// One vector per input text, in input order.
    async fn embedding(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// What one embedding job achieved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingSummary {
    pub embeddings_created: u64,
    /// Blocks carrying the job's flag after the job, including earlier runs
    pub embedded_blocks: u64,
    pub embedding_dims: u32,
    pub time_stamp: String,
}

impl EmbeddingSummary {
    #[inline]
    pub fn new(embeddings_created: u64, embedded_blocks: u64, embedding_dims: u32) -> Self {
        Self {
            embeddings_created,
            embedded_blocks,
            embedding_dims,
            time_stamp: Utc::now().to_rfc3339(),
        }
    }
}
