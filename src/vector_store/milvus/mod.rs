#[cfg(test)]
mod tests;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use super::rest::RestClient;
use super::{EmbeddedBlock, EngineContext, VectorHit, VectorStore};
use crate::{IndexError, Result};

const BLOCK_ID_MAX_LENGTH: u32 = 64;

/// Milvus collection through the v2 REST API, with a COSINE AUTOINDEX on `vector`.
pub struct MilvusStore {
    client: RestClient,
    collection: String,
    dims: u32,
}

impl MilvusStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::new(&context)?);
            Ok(store)
        }
        .boxed()
    }

    pub fn new(context: &EngineContext) -> Result<Self> {
        let settings = &context.settings.milvus;
        let client = RestClient::new(&settings.url)?.with_bearer(settings.token.as_deref());

        Ok(Self {
            client,
            collection: context.index_name("milvus"),
            dims: context.dims,
        })
    }

    #[inline]
    pub fn with_client(mut self, client: RestClient) -> Self {
        self.client = client;
        self
    }

    /// Milvus answers 200 with a non-zero `code` on failure.
    async fn call(&self, endpoint: &str, body: Value) -> Result<Value> {
        let response = self
            .client
            .post_required(&format!("v2/vectordb/{}", endpoint), &body)
            .await?;
        match response["code"].as_i64() {
            Some(0) | None => Ok(response),
            Some(code) => Err(IndexError::VectorStore(format!(
                "Milvus {} failed with code {}: {}",
                endpoint,
                code,
                response["message"].as_str().unwrap_or("no message")
            ))),
        }
    }

    async fn has_collection(&self) -> Result<bool> {
        let response = self.call(
            "collections/has",
            json!({"collectionName": self.collection}),
        ).await?;
        Ok(response["data"]["has"].as_bool().unwrap_or(false))
    }
}

#[async_trait]
impl VectorStore for MilvusStore {
    fn engine_name(&self) -> &'static str {
        "milvus"
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn ensure_index(&self) -> Result<()> {
        if self.has_collection().await? {
            debug!("Milvus collection {} already exists", self.collection);
            return Ok(());
        }

        self.call(
            "collections/create",
            json!({
                "collectionName": self.collection,
                "schema": {
                    "autoId": false,
                    "enableDynamicField": false,
                    "fields": [
                        {
                            "fieldName": "block_id",
                            "dataType": "VarChar",
                            "isPrimary": true,
                            "elementTypeParams": {"max_length": BLOCK_ID_MAX_LENGTH},
                        },
                        {"fieldName": "doc_id", "dataType": "Int64"},
                        {
                            "fieldName": "vector",
                            "dataType": "FloatVector",
                            "elementTypeParams": {"dim": self.dims},
                        },
                    ],
                },
                "indexParams": [{
                    "fieldName": "vector",
                    "indexName": "vector_index",
                    "metricType": "COSINE",
                    "indexType": "AUTOINDEX",
                }],
            }),
        ).await?;
        info!("Created Milvus collection {}", self.collection);
        Ok(())
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        let rows: Vec<Value> = batch
            .iter()
            .map(|entry| json!({"block_id": entry.id, "doc_id": entry.doc_id, "vector": entry.vector}))
            .collect();

        self.call(
            "entities/upsert",
            json!({"collectionName": self.collection, "data": rows}),
        ).await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if !self.has_collection().await? {
            return Ok(Vec::new());
        }

        let response = self.call(
            "entities/search",
            json!({
                "collectionName": self.collection,
                "data": [vector],
                "annsField": "vector",
                "limit": k,
                "outputFields": ["block_id"],
            }),
        ).await?;

        let Some(hits) = response["data"].as_array() else {
            return Ok(Vec::new());
        };
        hits.iter()
            .map(|hit| -> Result<VectorHit> {
                let id = hit["block_id"].as_str().ok_or_else(|| {
                    IndexError::VectorStore("Milvus hit has no block_id".to_string())
                })?;
                // COSINE metric reports similarity
                let score = hit["distance"].as_f64().unwrap_or_default() as f32;
                Ok(VectorHit::from_score(id, score))
            })
            .collect()
    }

    async fn delete_index(&self) -> Result<()> {
        self.call(
            "collections/drop",
            json!({"collectionName": self.collection}),
        ).await?;
        info!("Dropped Milvus collection {}", self.collection);
        Ok(())
    }
}
