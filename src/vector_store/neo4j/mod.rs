
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::future::{BoxFuture, FutureExt};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{debug, info};

use super::rest::RestClient;
use super::{EmbeddedBlock, EngineContext, VectorHit, VectorStore};
use crate::{IndexError, Result};

/// Neo4j vector index over `(:label {_id, doc_ID, embedding})` nodes, driven
/// through the transactional Cypher HTTP endpoint.
///
/// The index name doubles as the node label, so every library and model keeps its
/// nodes apart.
pub struct Neo4jStore {
    client: RestClient,
    database: String,
    index_name: String,
    dims: u32,
}

impl Neo4jStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::new(&context)?);
            Ok(store)
        }
        .boxed()
    }

    pub fn new(context: &EngineContext) -> Result<Self> {
        let settings = &context.settings.neo4j;
        let credentials = STANDARD.encode(format!("{}:{}", settings.user, settings.password));
        let client = RestClient::new(&settings.url)?
            .with_header("Authorization", &format!("Basic {}", credentials));

        Ok(Self {
            client,
            database: settings.database.clone(),
            index_name: context.index_name("neo4j"),
            dims: context.dims,
        })
    }

    #[inline]
    pub fn with_client(mut self, client: RestClient) -> Self {
        self.client = client;
        self
    }

    fn label(&self) -> String {
        format!("`{}`", self.index_name.replace('`', ""))
    }

    /// Run one statement in an auto-commit transaction and return its row values.
    async fn run(&self, statement: &str, parameters: Value) -> Result<Vec<Vec<Value>>> {
        let response = self.client.post_required(
            &format!("db/{}/tx/commit", self.database),
            &json!({"statements": [{"statement": statement, "parameters": parameters}]}),
        ).await?;

        if let Some(error) = response["errors"].as_array().and_then(|errors| errors.first()) {
            return Err(IndexError::VectorStore(format!(
                "Neo4j {}: {}",
                error["code"].as_str().unwrap_or("error"),
                error["message"].as_str().unwrap_or("no message")
            )));
        }

        Ok(response["results"][0]["data"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(|entry| entry["row"].as_array().cloned())
            .collect())
    }

    async fn index_exists(&self) -> Result<bool> {
        let rows = self.run(
            "SHOW INDEXES YIELD name WHERE name = $name RETURN count(*)",
            json!({"name": self.index_name}),
        ).await?;
        Ok(rows
            .first()
            .and_then(|row| row.first())
            .and_then(Value::as_u64)
            .unwrap_or_default()
            > 0)
    }
}

#[async_trait]
impl VectorStore for Neo4jStore {
    fn engine_name(&self) -> &'static str {
        "neo4j"
    }

    fn collection_name(&self) -> &str {
        &self.index_name
    }

    async fn ensure_index(&self) -> Result<()> {
        let statement = format!(
            "CREATE VECTOR INDEX {} IF NOT EXISTS FOR (b:{}) ON (b.embedding) \
             OPTIONS {{indexConfig: {{`vector.dimensions`: {}, `vector.similarity_function`: 'cosine'}}}}",
            self.label(),
            self.label(),
            self.dims
        );
        self.run(&statement, json!({})).await?;
        debug!("Neo4j vector index {} ready", self.index_name);
        Ok(())
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        let rows: Vec<Value> = batch
            .iter()
            .map(|entry| json!({"id": entry.id, "doc_id": entry.doc_id, "embedding": entry.vector}))
            .collect();
        let statement = format!(
            "UNWIND $rows AS row MERGE (b:{} {{_id: row.id}}) \
             SET b.doc_ID = row.doc_id, b.embedding = row.embedding",
            self.label()
        );
        self.run(&statement, json!({"rows": rows})).await?;
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if !self.index_exists().await? {
            return Ok(Vec::new());
        }

        let rows = self.run(
            "CALL db.index.vector.queryNodes($index, $k, $vector) YIELD node, score \
             RETURN node._id, score",
            json!({"index": self.index_name, "k": k, "vector": vector}),
        ).await?;
        rows.iter()
            .map(|row| -> Result<VectorHit> {
                let id = row.first().and_then(Value::as_str).ok_or_else(|| {
                    IndexError::VectorStore("Neo4j node has no _id".to_string())
                })?;
                let score = row.get(1).and_then(Value::as_f64).unwrap_or_default() as f32;
                Ok(VectorHit::from_score(id, score))
            })
            .collect()
    }

    async fn delete_index(&self) -> Result<()> {
        self.run(&format!("DROP INDEX {} IF EXISTS", self.label()), json!({})).await?;
        self.run(
            &format!("MATCH (b:{}) DETACH DELETE b", self.label()),
            json!({}),
        ).await?;
        info!("Deleted Neo4j index and nodes {}", self.index_name);
        Ok(())
    }
}
