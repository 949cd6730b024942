#[cfg(test)]
mod tests;

use arrow::array::{Array, FixedSizeListArray, Float32Array, Int64Array, RecordBatchIterator, StringArray};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt};
use futures::TryStreamExt;
use itertools::Itertools;
use lancedb::query::{ExecutableQuery, QueryBase};
use lancedb::{Connection, DistanceType};
use std::sync::Arc;
use tracing::{debug, info};

use super::{EmbeddedBlock, EngineContext, VectorHit, VectorStore};
use crate::{IndexError, Result};

/// Embedded LanceDB table per library and model, under the library's vector directory.
pub struct LanceDbStore {
    connection: Connection,
    table_name: String,
    dims: u32,
}

impl LanceDbStore {
    pub fn open(context: EngineContext) -> BoxFuture<'static, Result<Arc<dyn VectorStore>>> {
        async move {
            let store: Arc<dyn VectorStore> = Arc::new(Self::connect(&context).await?);
            Ok(store)
        }
        .boxed()
    }

    pub async fn connect(context: &EngineContext) -> Result<Self> {
        let db_path = context.vector_dir.join("lancedb");
        std::fs::create_dir_all(&db_path).map_err(|e| {
            IndexError::VectorStore(format!("Failed to create LanceDB directory: {}", e))
        })?;

        let uri = format!("file://{}", db_path.display());
        debug!("Connecting to LanceDB at {}", uri);
        let connection = lancedb::connect(&uri)
            .execute()
            .await
            .map_err(|e| lance_error("connect to LanceDB", e))?;

        Ok(Self {
            connection,
            table_name: context.index_name("lancedb"),
            dims: context.dims,
        })
    }

    fn schema(&self) -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new("doc_id", DataType::Int64, false),
            Field::new(
                "vector",
                DataType::FixedSizeList(
                    Arc::new(Field::new("item", DataType::Float32, false)),
                    self.dims as i32,
                ),
                false,
            ),
        ]))
    }

    async fn table_exists(&self) -> Result<bool> {
        let table_names = self
            .connection
            .table_names()
            .execute()
            .await
            .map_err(|e| lance_error("list tables", e))?;
        Ok(table_names.contains(&self.table_name))
    }

    fn record_batch(&self, batch: &[EmbeddedBlock]) -> Result<RecordBatch> {
        let dims = self.dims as usize;
        let mut flat_values = Vec::with_capacity(batch.len() * dims);
        for entry in batch {
            if entry.vector.len() != dims {
                return Err(IndexError::Embedding(format!(
                    "Vector for block {} has {} dimensions, table expects {}",
                    entry.id,
                    entry.vector.len(),
                    dims
                )));
            }
            flat_values.extend_from_slice(&entry.vector);
        }

        let field = Arc::new(Field::new("item", DataType::Float32, false));
        let vectors = FixedSizeListArray::try_new(
            field,
            self.dims as i32,
            Arc::new(Float32Array::from(flat_values)),
            None,
        )
        .map_err(|e| IndexError::VectorStore(format!("Failed to create vector array: {}", e)))?;

        let arrays: Vec<Arc<dyn Array>> = vec![
            Arc::new(StringArray::from_iter_values(batch.iter().map(|e| e.id.as_str()))),
            Arc::new(Int64Array::from_iter_values(batch.iter().map(|e| e.doc_id))),
            Arc::new(vectors),
        ];

        RecordBatch::try_new(self.schema(), arrays)
            .map_err(|e| IndexError::VectorStore(format!("Failed to create record batch: {}", e)))
    }
}

fn lance_error(action: &str, error: lancedb::Error) -> IndexError {
    IndexError::VectorStore(format!("Failed to {}: {}", action, error))
}

/// `id IN ('a', 'b')` with quotes escaped.
fn id_predicate(batch: &[EmbeddedBlock]) -> String {
    let ids = batch
        .iter()
        .map(|e| format!("'{}'", e.id.replace('\'', "''")))
        .join(", ");
    format!("id IN ({})", ids)
}

#[async_trait]
impl VectorStore for LanceDbStore {
    fn engine_name(&self) -> &'static str {
        "lancedb"
    }

    fn collection_name(&self) -> &str {
        &self.table_name
    }

    async fn ensure_index(&self) -> Result<()> {
        if self.table_exists().await? {
            debug!("LanceDB table {} already exists", self.table_name);
            return Ok(());
        }

        self.connection
            .create_empty_table(&self.table_name, self.schema())
            .execute()
            .await
            .map_err(|e| lance_error("create table", e))?;
        info!(
            "Created LanceDB table {} with {} dimensions",
            self.table_name, self.dims
        );
        Ok(())
    }

    async fn upsert(&self, batch: &[EmbeddedBlock]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let record_batch = self.record_batch(batch)?;
        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| lance_error("open table", e))?;

        // entries for re-embedded blocks are replaced, not duplicated
        table
            .delete(&id_predicate(batch))
            .await
            .map_err(|e| lance_error("delete replaced vectors", e))?;

        let schema = record_batch.schema();
        let reader = RecordBatchIterator::new(std::iter::once(Ok(record_batch)), schema);
        table
            .add(reader)
            .execute()
            .await
            .map_err(|e| lance_error("insert vectors", e))?;

        debug!("Stored {} vectors in {}", batch.len(), self.table_name);
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<VectorHit>> {
        if !self.table_exists().await? {
            return Ok(Vec::new());
        }

        let table = self
            .connection
            .open_table(&self.table_name)
            .execute()
            .await
            .map_err(|e| lance_error("open table", e))?;

        let mut results = table
            .vector_search(vector)
            .map_err(|e| lance_error("create vector search", e))?
            .column("vector")
            .distance_type(DistanceType::Cosine)
            .limit(k)
            .execute()
            .await
            .map_err(|e| lance_error("execute search", e))?;

        let mut hits = Vec::new();
        while let Some(batch) = results
            .try_next()
            .await
            .map_err(|e| lance_error("read result stream", e))?
        {
            let ids = batch
                .column_by_name("id")
                .and_then(|col| col.as_any().downcast_ref::<StringArray>())
                .ok_or_else(|| IndexError::VectorStore("Missing id column".to_string()))?;
            let distances = batch
                .column_by_name("_distance")
                .and_then(|col| col.as_any().downcast_ref::<Float32Array>())
                .ok_or_else(|| IndexError::VectorStore("Missing _distance column".to_string()))?;

            for row in 0..batch.num_rows() {
                hits.push(VectorHit::id(ids.value(row), distances.value(row)));
            }
        }
        Ok(hits)
    }

    async fn delete_index(&self) -> Result<()> {
        if self.table_exists().await? {
            self.connection
                .drop_table(&self.table_name)
                .await
                .map_err(|e| lance_error("drop table", e))?;
            info!("Dropped LanceDB table {}", self.table_name);
        }
        Ok(())
    }
}
