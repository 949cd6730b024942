// Fakes shared by unit tests

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use crate::config::{Config, TextIndexBackend, TextIndexConfig};
use crate::embedding::{EmbeddingModel, StatusSink};
use crate::text_index::{self, Block, CollectionWriter, LibraryCard, TextIndex};
use crate::vector_store::{EmbeddedBlock, EngineContext};
use crate::{IndexError, Result};

/// Deterministic bag-of-words model: each word bumps one bucket.
pub struct HashModel {
    dims: u32,
    calls: AtomicUsize,
    fail_on_call: Option<usize>,
}

impl HashModel {
    pub fn new(dims: u32) -> Self {
        Self {
            dims,
            calls: AtomicUsize::new(0),
            fail_on_call: None,
        }
    }

    /// Fails the `call`th request (1-based).
    pub fn failing_on(dims: u32, call: usize) -> Self {
        Self {
            fail_on_call: Some(call),
            ..Self::new(dims)
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dims as usize];
        for word in text.split_whitespace() {
            let bucket = word
                .to_lowercase()
                .bytes()
                .fold(7usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize))
                % vector.len();
            vector[bucket] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

#[async_trait]
impl EmbeddingModel for HashModel {
    fn model_name(&self) -> &str {
        "hash-model"
    }

    fn embedding_dims(&self) -> u32 {
        self.dims
    }

    async fn embedding(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(IndexError::Embedding("model went away".to_string()));
        }
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Status sink that remembers every call.
#[derive(Default)]
pub struct RecordingStatus {
    pub totals: Mutex<Vec<u64>>,
    pub increments: Mutex<Vec<u64>>,
}

impl RecordingStatus {
    pub fn processed(&self) -> u64 {
        self.increments.lock().map(|v| v.iter().sum()).unwrap_or_default()
    }
}

#[async_trait]
impl StatusSink for RecordingStatus {
    async fn new_embedding_status(&self, _library: &str, _model: &str, total: u64) -> Result<()> {
        if let Ok(mut totals) = self.totals.lock() {
            totals.push(total);
        }
        Ok(())
    }

    async fn increment_embedding_status(
        &self,
        _library: &str,
        _model: &str,
        delta: u64,
    ) -> Result<()> {
        if let Ok(mut increments) = self.increments.lock() {
            increments.push(delta);
        }
        Ok(())
    }
}

/// A built SQLite text index with a card, holding one block per text (doc_ID = position + 1).
pub async fn seeded_index(dir: &TempDir, texts: &[&str]) -> (Arc<dyn TextIndex>, Vec<String>) {
    seeded_index_on(dir, TextIndexBackend::Sqlite, texts).await
}

pub async fn seeded_index_on(
    dir: &TempDir,
    backend: TextIndexBackend,
    texts: &[&str],
) -> (Arc<dyn TextIndex>, Vec<String>) {
    let config = TextIndexConfig {
        backend,
        ..TextIndexConfig::default()
    };
    let index = text_index::open(&config, dir.path(), "acct", "payroll")
        .await
        .expect("should open text index");
    index.build_text_index().await.expect("should build");
    index
        .save_library_card(&LibraryCard::new("payroll", "acct"))
        .await
        .expect("should save card");

    let writer = CollectionWriter::new(Arc::clone(&index));
    let mut ids = Vec::new();
    for (position, text) in texts.iter().enumerate() {
        let block = Block::new()
            .with("doc_ID", position as i64 + 1)
            .with("block_ID", 0)
            .with("text_search", *text)
            .with("text", *text);
        ids.push(writer.write_new_record(&block).await.expect("should write"));
    }
    (index, ids)
}

/// Engine context rooted in `dir` with default engine settings.
pub fn engine_context(dir: &TempDir, dims: u32) -> EngineContext {
    let config = Config {
        base_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    EngineContext::from_config(&config, "payroll", "mini", dims)
}

pub fn embedded(id: &str, position: i64, vector: Vec<f32>) -> EmbeddedBlock {
    EmbeddedBlock {
        id: id.to_string(),
        doc_id: 1,
        position,
        text: format!("block {}", id),
        vector,
    }
}
