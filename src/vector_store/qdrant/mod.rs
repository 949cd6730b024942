#[cfg(test)]
mod tests;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use super::rest::RestClient;
use super::{EmbeddedBlock, EngineContext, VectorHit, VectorStore, point_uuid};
use crate::{IndexError, Result};

/// Qdrant collection over its REST API. Points are keyed by a UUID derived from the
/// block `_id`, which is also kept in the payload for reverse lookup.
pub struct QdrantStore {
    client: RestClient,
    collection: String,
    dims: u32,
}

impl QdrantStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::new(&context)?);
            Ok(store)
        }
        .boxed()
    }

    pub fn new(context: &EngineContext) -> Result<Self> {
        let settings = &context.settings.qdrant;
        let mut client = RestClient::new(&settings.url)?;
        if let Some(key) = settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            client = client.with_header("api-key", key);
        }

        Ok(Self {
            client,
            collection: context.index_name("qdrant"),
            dims: context.dims,
        })
    }

    #[inline]
    pub fn with_client(mut self, client: RestClient) -> Self {
        self.client = client;
        self
    }

    fn path(&self, suffix: &str) -> String {
        format!("collections/{}{}", self.collection, suffix)
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    fn engine_name(&self) -> &'static str {
        "qdrant"
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn ensure_index(&self) -> Result<()> {
        if self.client.get(&self.path("")).await?.is_some() {
            debug!("Qdrant collection {} already exists", self.collection);
            return Ok(());
        }

        self.client.put(
            &self.path(""),
            &json!({"vectors": {"size": self.dims, "distance": "Cosine"}}),
        ).await?;
        info!("Created Qdrant collection {}", self.collection);
        Ok(())
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        let points: Vec<Value> = batch
            .iter()
            .map(|entry| {
                json!({
                    "id": point_uuid(&entry.id).to_string(),
                    "vector": entry.vector,
                    "payload": {"_id": entry.id, "doc_ID": entry.doc_id},
                })
            })
            .collect();

        self.client
            .put(&self.path("/points?wait=true"), &json!({"points": points}))
            .await?
            .ok_or_else(|| {
                IndexError::VectorStore(format!("Qdrant collection {} is missing", self.collection))
            })?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let Some(response) = self.client.post(
            &self.path("/points/search"),
            &json!({"vector": vector, "limit": k, "with_payload": true}),
        ).await?
        else {
            return Ok(Vec::new());
        };

        let hits = response["result"]
            .as_array()
            .ok_or_else(|| IndexError::VectorStore("Qdrant search returned no result".to_string()))?;
        hits.iter()
            .map(|hit| -> Result<VectorHit> {
                let id = hit["payload"]["_id"].as_str().ok_or_else(|| {
                    IndexError::VectorStore("Qdrant point has no _id payload".to_string())
                })?;
                let score = hit["score"].as_f64().unwrap_or_default() as f32;
                Ok(VectorHit::from_score(id, score))
            })
            .collect()
    }

    async fn delete_index(&self) -> Result<()> {
        if self.client.delete(&self.path("")).await? {
            info!("Deleted Qdrant collection {}", self.collection);
        }
        Ok(())
    }
}
