#[cfg(test)]
mod tests;

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Value, json};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::rest::RestClient;
use super::{EmbeddedBlock, EngineContext, VectorHit, VectorStore};
use crate::embedding::EmbeddingSummary;
use crate::{IndexError, Result};

const API_VERSION: &str = "2024-07";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Serverless Pinecone index.
///
/// The control plane creates and describes indexes; vectors go to the per-index
/// host it reports, which is looked up once and cached.
pub struct PineconeStore {
    control: RestClient,
    api_key: String,
    index_name: String,
    dims: u32,
    cloud: String,
    region: String,
    namespace: String,
    readiness_timeout: Duration,
    poll_interval: Duration,
    data_plane: Mutex<Option<RestClient>>,
}

impl PineconeStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::new(&context)?);
            Ok(store)
        }
        .boxed()
    }

    pub fn new(context: &EngineContext) -> Result<Self> {
        let settings = &context.settings.pinecone;
        let api_key = settings
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                IndexError::Config("The pinecone engine needs vector_store.pinecone.api_key".to_string())
            })?;

        Ok(Self {
            control: Self::authorized(RestClient::new(&settings.controller_url)?, &api_key),
            api_key,
            index_name: context.index_name("pinecone"),
            dims: context.dims,
            cloud: settings.cloud.clone(),
            region: settings.region.clone(),
            namespace: settings.namespace.clone(),
            readiness_timeout: Duration::from_secs(settings.readiness_timeout_secs),
            poll_interval: DEFAULT_POLL_INTERVAL,
            data_plane: Mutex::new(None),
        })
    }

    #[inline]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    fn authorized(client: RestClient, api_key: &str) -> RestClient {
        client
            .with_header("Api-Key", api_key)
            .with_header("X-Pinecone-API-Version", API_VERSION)
    }

    fn index_path(&self) -> String {
        format!("indexes/{}", self.index_name)
    }

    async fn describe(&self) -> Result<Option<Value>> {
        self.control.get(&self.index_path()).await
    }

    /// Data-plane client for the index, or `None` when the index does not exist.
    async fn data_plane(&self) -> Result<Option<RestClient>> {
        let cached = self
            .data_plane
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(client) = cached {
            return Ok(Some(client));
        }

        let Some(description) = self.describe().await? else {
            return Ok(None);
        };
        let host = description["host"].as_str().ok_or_else(|| {
            IndexError::VectorStore(format!("Pinecone index {} has no host", self.index_name))
        })?;
        let base = if host.contains("://") {
            host.to_string()
        } else {
            format!("https://{}", host)
        };

        let client = Self::authorized(RestClient::new(&base)?, &self.api_key);
        *self
            .data_plane
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(client.clone());
        Ok(Some(client))
    }

    async fn require_data_plane(&self) -> Result<RestClient> {
        self.data_plane().await?.ok_or_else(|| {
            IndexError::VectorStore(format!("Pinecone index {} is missing", self.index_name))
        })
    }

    async fn wait_until_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.readiness_timeout;
        loop {
            let ready = self
                .describe()
                .await?
                .is_some_and(|d| d["status"]["ready"].as_bool().unwrap_or(false));
            if ready {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(IndexError::VectorStore(format!(
                    "Pinecone index {} not ready after {:?}",
                    self.index_name, self.readiness_timeout
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn vector_count(&self, client: &RestClient) -> Result<u64> {
        let stats = client.post_required("describe_index_stats", &json!({})).await?;
        Ok(stats["namespaces"][&self.namespace]["vectorCount"]
            .as_u64()
            .unwrap_or_default())
    }
}

#[async_trait]
impl VectorStore for PineconeStore {
    fn engine_name(&self) -> &'static str {
        "pinecone"
    }

    fn collection_name(&self) -> &str {
        &self.index_name
    }

    async fn ensure_index(&self) -> Result<()> {
        if self.describe().await?.is_none() {
            self.control.post_required(
                "indexes",
                &json!({
                    "name": self.index_name,
                    "dimension": self.dims,
                    "metric": "cosine",
                    "spec": {"serverless": {"cloud": self.cloud, "region": self.region}},
                }),
            ).await?;
            info!("Created Pinecone index {}", self.index_name);
        }

        self.wait_until_ready().await?;
        debug!("Pinecone index {} ready", self.index_name);
        Ok(())
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        let client = self.require_data_plane().await?;
        let vectors: Vec<Value> = batch
            .iter()
            .map(|entry| {
                json!({
                    "id": entry.id,
                    "values": entry.vector,
                    "metadata": {"doc_ID": entry.doc_id},
                })
            })
            .collect();

        client.post_required(
            "vectors/upsert",
            &json!({"vectors": vectors, "namespace": self.namespace}),
        ).await?;
        Ok(())
    }

    /// Pinecone indexes writes asynchronously. Wait until the namespace reports at
    /// least as many vectors as the library has embedded blocks.
    async fn finish_job(&self, summary: &EmbeddingSummary) -> Result<()> {
        let Some(client) = self.data_plane().await? else {
            return Ok(());
        };

        let deadline = Instant::now() + self.readiness_timeout;
        loop {
            let count = self.vector_count(&client).await?;
            if count >= summary.embedded_blocks {
                debug!("Pinecone index {} holds {} vectors", self.index_name, count);
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(
                    "Pinecone index {} reports {} of {} vectors after {:?}",
                    self.index_name, count, summary.embedded_blocks, self.readiness_timeout
                );
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        let Some(client) = self.data_plane().await? else {
            return Ok(Vec::new());
        };

        let response = client.post_required(
            "query",
            &json!({"vector": vector, "topK": k, "namespace": self.namespace}),
        ).await?;
        response["matches"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|hit| -> Result<VectorHit> {
                let id = hit["id"].as_str().ok_or_else(|| {
                    IndexError::VectorStore("Pinecone match has no id".to_string())
                })?;
                Ok(VectorHit::from_score(id, hit["score"].as_f64().unwrap_or_default() as f32))
            })
            .collect()
    }

    async fn delete_index(&self) -> Result<()> {
        let removed = self.control.delete(&self.index_path()).await?;
        *self
            .data_plane
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        if removed {
            info!("Deleted Pinecone index {}", self.index_name);
        }
        Ok(())
    }
}
