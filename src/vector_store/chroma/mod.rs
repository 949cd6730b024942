
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use super::rest::RestClient;
use super::{EmbeddedBlock, EngineContext, VectorHit, VectorStore};
use crate::{IndexError, Result};

/// Chroma collection addressed through the tenant/database REST API.
///
/// Data calls need the server-assigned collection id, which is resolved by name
/// once and cached.
pub struct ChromaStore {
    client: RestClient,
    collection: String,
    tenant: String,
    database: String,
    collection_id: Mutex<Option<String>>,
}

impl ChromaStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::new(&context)?);
            Ok(store)
        }
        .boxed()
    }

    pub fn new(context: &EngineContext) -> Result<Self> {
        let settings = &context.settings.chroma;
        Ok(Self {
            client: RestClient::new(&settings.url)?,
            collection: context.index_name("chroma"),
            tenant: settings.tenant.clone(),
            database: settings.database.clone(),
            collection_id: Mutex::new(None),
        })
    }

    #[inline]
    pub fn with_client(mut self, client: RestClient) -> Self {
        self.client = client;
        self
    }

    fn collections_path(&self) -> String {
        format!(
            "api/v2/tenants/{}/databases/{}/collections",
            self.tenant, self.database
        )
    }

    fn cached_id(&self) -> Option<String> {
        self.collection_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn remember_id(&self, id: Option<String>) {
        *self
            .collection_id
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = id;
    }

    /// The collection id, or `None` when no collection carries our name.
    async fn resolve_id(&self) -> Result<Option<String>> {
        if let Some(id) = self.cached_id() {
            return Ok(Some(id));
        }

        let Some(listing) = self.client.get(&self.collections_path()).await? else {
            return Ok(None);
        };
        let id = listing
            .as_array()
            .into_iter()
            .flatten()
            .find(|entry| entry["name"].as_str() == Some(self.collection.as_str()))
            .and_then(|entry| entry["id"].as_str())
            .map(str::to_string);

        if id.is_some() {
            self.remember_id(id.clone());
        }
        Ok(id)
    }

    async fn require_id(&self) -> Result<String> {
        self.resolve_id().await?.ok_or_else(|| {
            IndexError::VectorStore(format!("Chroma collection {} is missing", self.collection))
        })
    }
}

#[async_trait]
impl VectorStore for ChromaStore {
    fn engine_name(&self) -> &'static str {
        "chroma"
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }

    async fn ensure_index(&self) -> Result<()> {
        let created = self.client.post_required(
            &self.collections_path(),
            &json!({
                "name": self.collection,
                "get_or_create": true,
                "metadata": {"hnsw:space": "cosine"},
            }),
        ).await?;

        if let Some(id) = created["id"].as_str() {
            self.remember_id(Some(id.to_string()));
        }
        debug!("Chroma collection {} ready", self.collection);
        Ok(())
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        let id = self.require_id().await?;
        let ids: Vec<&str> = batch.iter().map(|entry| entry.id.as_str()).collect();
        let embeddings: Vec<&[f32]> = batch.iter().map(|entry| entry.vector.as_slice()).collect();
        let metadatas: Vec<Value> = batch
            .iter()
            .map(|entry| json!({"doc_ID": entry.doc_id}))
            .collect();
        let documents: Vec<&str> = batch.iter().map(|entry| entry.text.as_str()).collect();

        self.client.post_required(
            &format!("{}/{}/upsert", self.collections_path(), id),
            &json!({
                "ids": ids,
                "embeddings": embeddings,
                "metadatas": metadatas,
                "documents": documents,
            }),
        ).await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let Some(id) = self.resolve_id().await? else {
            return Ok(Vec::new());
        };

        let response = self.client.post_required(
            &format!("{}/{}/query", self.collections_path(), id),
            &json!({
                "query_embeddings": [vector],
                "n_results": k,
                "include": ["distances"],
            }),
        ).await?;

        // One result row per query embedding
        let ids = response["ids"][0].as_array().cloned().unwrap_or_default();
        let distances = response["distances"][0].as_array().cloned().unwrap_or_default();
        ids.iter()
            .zip(distances.iter())
            .map(|(id, distance)| -> Result<VectorHit> {
                let id = id.as_str().ok_or_else(|| {
                    IndexError::VectorStore("Chroma returned a non-string id".to_string())
                })?;
                Ok(VectorHit::id(id, distance.as_f64().unwrap_or_default() as f32))
            })
            .collect()
    }

    async fn delete_index(&self) -> Result<()> {
        let removed = self
            .client
            .delete(&format!("{}/{}", self.collections_path(), self.collection))
            .await?;
        self.remember_id(None);
        if removed {
            info!("Deleted Chroma collection {}", self.collection);
        }
        Ok(())
    }
}
