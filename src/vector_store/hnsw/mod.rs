
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use hnsw_rs::prelude::{DistCosine, Hnsw};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{EmbeddedBlock, EngineContext, FlagStrategy, HitKey, VectorHit, VectorStore};
use crate::config::HnswSettings;
use crate::{IndexError, Result};

const MAX_LAYER: usize = 16;

/// Append-only local vector file searched through an in-memory HNSW graph.
///
/// An entry's position in the file is its only identity, so blocks are flagged with
/// that position and hits are resolved through the flag. Positions are never reused:
/// a re-embedded block gets a new position and its old entry becomes unreachable.
/// One writer per file at a time.
pub struct HnswStore {
    path: PathBuf,
    name: String,
    dims: u32,
    settings: HnswSettings,
}

impl HnswStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::new(&context)?);
            Ok(store)
        }
        .boxed()
    }

    pub fn new(context: &EngineContext) -> Result<Self> {
        if context.dims == 0 {
            return Err(IndexError::Config(
                "The hnsw engine needs the embedding dimension".to_string(),
            ));
        }

        let name = context.index_name("hnsw");
        Ok(Self {
            path: context.vector_dir.join("hnsw").join(format!("{}.vec", name)),
            name,
            dims: context.dims,
            settings: context.settings.hnsw.clone(),
        })
    }

    fn record_len(&self) -> u64 {
        u64::from(self.dims) * 4
    }

    async fn load_vectors(&self) -> Result<Vec<Vec<f32>>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if bytes.len() as u64 % self.record_len() != 0 {
            return Err(IndexError::VectorStore(format!(
                "Vector file {} is not a whole number of {}-dimension records",
                self.path.display(),
                self.dims
            )));
        }

        Ok(bytes
            .chunks_exact(self.record_len() as usize)
            .map(|record| {
                record
                    .chunks_exact(4)
                    .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
                    .collect()
            })
            .collect())
    }
}

/// Build a graph over `vectors` and return the `k` nearest as (position, distance).
fn search_graph(
    vectors: &[Vec<f32>],
    query: &[f32],
    k: usize,
    settings: &HnswSettings,
) -> Vec<(usize, f32)> {
    if vectors.is_empty() || k == 0 {
        return Vec::new();
    }

    let hnsw = Hnsw::<f32, DistCosine>::new(
        settings.max_connections,
        vectors.len(),
        MAX_LAYER,
        settings.ef_construction,
        DistCosine,
    );
    let with_ids: Vec<(&Vec<f32>, usize)> = vectors
        .iter()
        .enumerate()
        .map(|(position, vector)| (vector, position))
        .collect();
    hnsw.parallel_insert(&with_ids);

    let k = k.min(vectors.len());
    hnsw.search(query, k, settings.ef_search.max(k))
        .into_iter()
        .map(|neighbour| (neighbour.d_id, neighbour.distance))
        .collect()
}

#[async_trait]
impl VectorStore for HnswStore {
    fn engine_name(&self) -> &'static str {
        "hnsw"
    }

    fn collection_name(&self) -> &str {
        &self.name
    }

    fn flag_strategy(&self) -> FlagStrategy {
        FlagStrategy::Sequential
    }

    async fn ensure_index(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    /// The number of records already in the file.
    async fn next_position(&self) -> Result<i64> {
        let len = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        Ok(i64::try_from(len / self.record_len()).unwrap_or(i64::MAX))
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        let Some(first) = batch.first() else {
            return Ok(());
        };

        let expected = self.next_position().await?;
        if first.position != expected {
            return Err(IndexError::VectorStore(format!(
                "Batch starts at position {} but {} holds {} vectors",
                first.position,
                self.path.display(),
                expected
            )));
        }

        let mut bytes = Vec::with_capacity(batch.len() * self.record_len() as usize);
        for entry in batch {
            if entry.vector.len() != self.dims as usize {
                return Err(IndexError::Embedding(format!(
                    "Vector for block {} has {} dimensions, expected {}",
                    entry.id,
                    entry.vector.len(),
                    self.dims
                )));
            }
            bytes.extend(entry.vector.iter().flat_map(|v| v.to_le_bytes()));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&bytes).await?;
        // positions must be durable before the flags that point at them
        file.sync_all().await?;

        debug!(
            "Appended {} vectors at position {} to {}",
            batch.len(),
            first.position,
            self.path.display()
        );
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let vectors = self.load_vectors().await?;
        let query = vector.to_vec();
        let settings = self.settings.clone();

        let neighbours =
            tokio::task::spawn_blocking(move || search_graph(&vectors, &query, k, &settings))
                .await
                .map_err(|e| IndexError::VectorStore(format!("HNSW search failed: {}", e)))?;

        Ok(neighbours
            .into_iter()
            .map(|(position, distance)| VectorHit {
                key: HitKey::Position(i64::try_from(position).unwrap_or(i64::MAX)),
                distance,
            })
            .collect())
    }

    /// Entries cannot be removed one by one, so the whole file goes.
    async fn delete_index(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                info!("Removed HNSW vector file {}", self.path.display());
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
