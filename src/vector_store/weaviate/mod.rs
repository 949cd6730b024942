
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use super::rest::RestClient;
use super::{EmbeddedBlock, EngineContext, VectorHit, VectorStore, point_uuid};
use crate::{IndexError, Result};

/// Weaviate class with caller-supplied vectors and cosine distance.
pub struct WeaviateStore {
    client: RestClient,
    class: String,
    dims: u32,
}

impl WeaviateStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::new(&context)?);
            Ok(store)
        }
        .boxed()
    }

    pub fn new(context: &EngineContext) -> Result<Self> {
        let settings = &context.settings.weaviate;
        Ok(Self {
            client: RestClient::new(&settings.url)?.with_bearer(settings.api_key.as_deref()),
            class: context.index_name("weaviate"),
            dims: context.dims,
        })
    }

    #[inline]
    pub fn with_client(mut self, client: RestClient) -> Self {
        self.client = client;
        self
    }

    fn schema_path(&self) -> String {
        format!("v1/schema/{}", self.class)
    }

    fn near_vector_query(&self, vector: &[f32], k: usize) -> Result<String> {
        let vector = serde_json::to_string(vector)?;
        Ok(format!(
            "{{ Get {{ {}(nearVector: {{vector: {}}}, limit: {}) {{ blockKey _additional {{ distance }} }} }} }}",
            self.class, vector, k
        ))
    }
}

fn first_error(errors: &Value) -> Option<String> {
    errors
        .as_array()
        .and_then(|list| list.first())
        .map(|error| error["message"].as_str().unwrap_or("unknown error").to_string())
}

#[async_trait]
impl VectorStore for WeaviateStore {
    fn engine_name(&self) -> &'static str {
        "weaviate"
    }

    fn collection_name(&self) -> &str {
        &self.class
    }

    async fn ensure_index(&self) -> Result<()> {
        if self.client.get(&self.schema_path()).await?.is_some() {
            debug!("Weaviate class {} already exists", self.class);
            return Ok(());
        }

        self.client.post_required(
            "v1/schema",
            &json!({
                "class": self.class,
                "vectorizer": "none",
                "vectorIndexConfig": {"distance": "cosine"},
                "properties": [
                    {"name": "blockKey", "dataType": ["text"]},
                    {"name": "docId", "dataType": ["int"]},
                ],
            }),
        ).await?;
        info!("Created Weaviate class {} ({} dims)", self.class, self.dims);
        Ok(())
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        let objects: Vec<Value> = batch
            .iter()
            .map(|entry| {
                json!({
                    "class": self.class,
                    "id": point_uuid(&entry.id).to_string(),
                    "vector": entry.vector,
                    "properties": {"blockKey": entry.id, "docId": entry.doc_id},
                })
            })
            .collect();

        let response = self
            .client
            .post_required("v1/batch/objects", &json!({"objects": objects}))
            .await?;

        // Batch calls succeed as a whole and report failures per object
        for object in response.as_array().into_iter().flatten() {
            if let Some(message) = first_error(&object["result"]["errors"]["error"]) {
                return Err(IndexError::VectorStore(format!(
                    "Weaviate rejected object {}: {}",
                    object["id"].as_str().unwrap_or("?"),
                    message
                )));
            }
        }
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if self.client.get(&self.schema_path()).await?.is_none() {
            return Ok(Vec::new());
        }

        let response = self.client.post_required(
            "v1/graphql",
            &json!({"query": self.near_vector_query(vector, k)?}),
        ).await?;
        if let Some(message) = first_error(&response["errors"]) {
            return Err(IndexError::VectorStore(format!("Weaviate query failed: {}", message)));
        }

        response["data"]["Get"][&self.class]
            .as_array()
            .into_iter()
            .flatten()
            .map(|hit| -> Result<VectorHit> {
                let id = hit["blockKey"].as_str().ok_or_else(|| {
                    IndexError::VectorStore("Weaviate object has no blockKey".to_string())
                })?;
                let distance = hit["_additional"]["distance"].as_f64().unwrap_or_default() as f32;
                Ok(VectorHit::id(id, distance))
            })
            .collect()
    }

    async fn delete_index(&self) -> Result<()> {
        if self.client.delete(&self.schema_path()).await? {
            info!("Deleted Weaviate class {}", self.class);
        }
        Ok(())
    }
}
