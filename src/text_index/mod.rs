// Text index module
// One contract over three backends (SQLite FTS5, Postgres, tantivy document store)
// plus the retrieval and writer facades the rest of the crate goes through.

pub mod analyzer;
pub mod cursor;
pub mod document_store;
pub mod model;
pub mod postgres;
pub mod schema;
pub mod sqlite;

#[cfg(test)]
mod tests;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::{TextIndexBackend, TextIndexConfig};
use crate::custom_table::{Cell, ColumnSpec};
use crate::{IndexError, Result};

pub use cursor::Cursor;
pub use model::{Block, EmbeddingRecord, FieldValue, Filter, FilterValue, LibraryCard};
pub use schema::safe_name;

/// Operations every text-index backend implements identically.
///
/// Filters are conjunctive and validated against the block field list. Keyword
/// search is conjunctive over stemmed terms and ranked best first.
#[async_trait]
pub trait TextIndex: Send + Sync {
    fn backend(&self) -> TextIndexBackend;

    /// Normalized name of the block collection (table, or index directory)
    fn collection_name(&self) -> &str;

    fn account_name(&self) -> &str;

    async fn check_if_table_build_required(&self) -> Result<bool>;

    /// Create the block collection and its search structures if absent.
    async fn build_text_index(&self) -> Result<()>;

    /// Drop every block and the library card.
    async fn delete_collection(&self) -> Result<()>;

    async fn find(&self, filters: &[Filter]) -> Result<Vec<Block>>;

    /// Ranked keyword search intersected with `filters`.
    async fn text_search(&self, text: &str, filters: &[Filter]) -> Result<Vec<Block>>;

    async fn get_whole_collection(&self) -> Result<Cursor>;

    async fn count_documents(&self, filters: &[Filter]) -> Result<u64>;

    /// Blocks of `doc_ids` when given, otherwise every block not yet carrying `flag_key`.
    /// The count comes from a separate pass made before the scan starts.
    async fn embedding_job_cursor(
        &self,
        flag_key: &str,
        doc_ids: Option<&[i64]>,
    ) -> Result<(u64, Cursor)>;

    async fn count_embedded_blocks(&self, flag_key: &str) -> Result<u64>;

    async fn get_distinct_list(&self, key: &str) -> Result<Vec<FieldValue>>;

    /// Insert a shaped block and return its new key.
    async fn insert_block(&self, block: &Block) -> Result<String>;

    /// Set `key` to `value` on the first block matching `filters`. Returns rows changed.
    async fn update_one_record(&self, filters: &[Filter], key: &str, value: &Value)
    -> Result<u64>;

    async fn delete_record_by_key(&self, key: &str, value: &FieldValue) -> Result<u64>;

    async fn add_new_embedding_flag(&self, id: &str, flag_key: &str, token: &Value)
    -> Result<()>;

    /// Flag every `(id, token)` pair under `flag_key` as one write.
    async fn add_embedding_flags(&self, flag_key: &str, flags: &[(String, Value)]) -> Result<()> {
        for (id, token) in flags {
            self.add_new_embedding_flag(id, flag_key, token).await?;
        }
        Ok(())
    }

    /// Remove `flag_key` from every block. Returns the number of blocks touched.
    async fn unset_embedding_flag(&self, flag_key: &str) -> Result<u64>;

    /// The block whose `flag_key` token equals `token`.
    async fn lookup_embedding_flag(&self, flag_key: &str, token: &Value)
    -> Result<Option<Block>>;

    async fn get_library_card(&self) -> Result<Option<LibraryCard>>;

    async fn save_library_card(&self, card: &LibraryCard) -> Result<()>;

    /// Merge `record` into the stored card's embedding ledger and return the result.
    ///
    /// The read and the write happen under one lock, so concurrent merges for different
    /// engines all survive.
    async fn merge_embedding_record(
        &self,
        record: EmbeddingRecord,
        delete: bool,
    ) -> Result<LibraryCard>;

    /// Overwrite only the content counts of the stored card.
    async fn update_card_counts(&self, card: &LibraryCard) -> Result<()>;

    /// Atomically bump the per-library document counter and return the new value.
    async fn get_and_increment_doc_id(&self) -> Result<i64>;

    /// Delete the blocks matching `filters` and insert `block` in their place.
    async fn replace_record(&self, filters: &[Filter], block: &Block) -> Result<String> {
        for existing in self.find(filters).await? {
            self.delete_record_by_key(
                schema::KEY_FIELD,
                &FieldValue::Text(existing.id().to_string()),
            )
            .await?;
        }
        self.insert_block(block).await
    }

    async fn create_table(&self, name: &str, _columns: &[ColumnSpec]) -> Result<()> {
        Err(self.custom_tables_unsupported(name))
    }

    async fn insert_rows(
        &self,
        name: &str,
        _columns: &[ColumnSpec],
        _rows: &[Vec<Cell>],
    ) -> Result<u64> {
        Err(self.custom_tables_unsupported(name))
    }

    async fn query_table(
        &self,
        name: &str,
        _columns: &[ColumnSpec],
        _filter: Option<(&str, &Cell)>,
    ) -> Result<Vec<Map<String, Value>>> {
        Err(self.custom_tables_unsupported(name))
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        Err(self.custom_tables_unsupported(name))
    }

    fn custom_tables_unsupported(&self, name: &str) -> IndexError {
        IndexError::Config(format!(
            "Custom table {} requires a relational text index backend, not {}",
            name,
            self.backend()
        ))
    }
}

/// Open the backend named in `config` for one library's collection.
///
/// On-disk backends keep their files under `root`.
pub async fn open(
    config: &TextIndexConfig,
    root: &Path,
    account_name: &str,
    library_name: &str,
) -> Result<Arc<dyn TextIndex>> {
    let collection = safe_name(library_name)?;
    debug!(
        "Opening {} text index for {}/{}",
        config.backend, account_name, collection
    );

    let index: Arc<dyn TextIndex> = match config.backend {
        TextIndexBackend::Sqlite => Arc::new(
            sqlite::SqliteTextIndex::open(
                &root.join(format!("{}.db", account_name)),
                account_name,
                &collection,
                config.close_cursor_on_exhaustion,
            )
            .await?,
        ),
        TextIndexBackend::Postgres => Arc::new(
            postgres::PostgresTextIndex::connect(
                &config.postgres_url,
                account_name,
                &collection,
                config.close_cursor_on_exhaustion,
            )
            .await?,
        ),
        TextIndexBackend::DocumentStore => Arc::new(document_store::DocumentStore::open(
            &root.join(account_name),
            account_name,
            &collection,
        )?),
    };
    Ok(index)
}

/// Read side of the text-index facade. Holds no state beyond the backend handle.
#[derive(Clone)]
pub struct CollectionRetrieval {
    index: Arc<dyn TextIndex>,
}

impl CollectionRetrieval {
    #[inline]
    pub fn new(index: Arc<dyn TextIndex>) -> Self {
        Self { index }
    }

    #[inline]
    pub fn backend(&self) -> TextIndexBackend {
        self.index.backend()
    }

    #[inline]
    pub fn collection_name(&self) -> &str {
        self.index.collection_name()
    }

    #[inline]
    pub async fn lookup(&self, key: &str, value: impl Into<FieldValue>) -> Result<Vec<Block>> {
        self.index.find(&[Filter::equals(key, value)]).await
    }

    #[inline]
    pub async fn filter_by_key(
        &self,
        key: &str,
        value: impl Into<FieldValue>,
    ) -> Result<Vec<Block>> {
        self.index.find(&[Filter::equals(key, value)]).await
    }

    #[inline]
    pub async fn filter_by_key_value_range(
        &self,
        key: &str,
        values: Vec<FieldValue>,
    ) -> Result<Vec<Block>> {
        self.index.find(&[Filter::one_of(key, values)]).await
    }

    #[inline]
    pub async fn filter_by_key_ne_value(
        &self,
        key: &str,
        value: impl Into<FieldValue>,
    ) -> Result<Vec<Block>> {
        self.index.find(&[Filter::not_equals(key, value)]).await
    }

    #[inline]
    pub async fn find(&self, filters: &[Filter]) -> Result<Vec<Block>> {
        self.index.find(filters).await
    }

    /// Keyword search ranked by relevance.
    #[inline]
    pub async fn basic_query(&self, text: &str) -> Result<Vec<Block>> {
        self.index.text_search(text, &[]).await
    }

    #[inline]
    pub async fn text_search_with_key_value_dict_filter(
        &self,
        text: &str,
        dict: &BTreeMap<String, FilterValue>,
    ) -> Result<Vec<Block>> {
        self.index.text_search(text, &Filter::from_dict(dict)).await
    }

    #[inline]
    pub async fn text_search_with_key_low_high_range(
        &self,
        text: &str,
        key: &str,
        low: impl Into<FieldValue>,
        high: impl Into<FieldValue>,
    ) -> Result<Vec<Block>> {
        self.index
            .text_search(text, &[Filter::range(key, low, high)])
            .await
    }

    #[inline]
    pub async fn text_search_with_key_value_range(
        &self,
        text: &str,
        key: &str,
        values: Vec<FieldValue>,
    ) -> Result<Vec<Block>> {
        self.index
            .text_search(text, &[Filter::one_of(key, values)])
            .await
    }

    #[inline]
    pub async fn get_whole_collection(&self) -> Result<Cursor> {
        self.index.get_whole_collection().await
    }

    #[inline]
    pub async fn count_documents(&self, filters: &[Filter]) -> Result<u64> {
        self.index.count_documents(filters).await
    }

    #[inline]
    pub async fn embedding_job_cursor(
        &self,
        flag_key: &str,
        doc_ids: Option<&[i64]>,
    ) -> Result<(u64, Cursor)> {
        self.index.embedding_job_cursor(flag_key, doc_ids).await
    }

    #[inline]
    pub async fn count_embedded_blocks(&self, flag_key: &str) -> Result<u64> {
        self.index.count_embedded_blocks(flag_key).await
    }

    #[inline]
    pub async fn get_distinct_list(&self, key: &str) -> Result<Vec<FieldValue>> {
        self.index.get_distinct_list(key).await
    }

    #[inline]
    pub async fn lookup_embedding_flag(
        &self,
        flag_key: &str,
        token: &Value,
    ) -> Result<Option<Block>> {
        self.index.lookup_embedding_flag(flag_key, token).await
    }

    #[inline]
    pub async fn get_library_card(&self) -> Result<Option<LibraryCard>> {
        self.index.get_library_card().await
    }

    #[inline]
    pub async fn check_if_table_build_required(&self) -> Result<bool> {
        self.index.check_if_table_build_required().await
    }
}

/// Write side of the text-index facade.
#[derive(Clone)]
pub struct CollectionWriter {
    index: Arc<dyn TextIndex>,
}

impl CollectionWriter {
    #[inline]
    pub fn new(index: Arc<dyn TextIndex>) -> Self {
        Self { index }
    }

    /// Insert a block as given. Unknown fields are rejected, missing ones default.
    #[inline]
    pub async fn write_new_record(&self, block: &Block) -> Result<String> {
        let shaped = schema::shape_block(block)?;
        self.index.insert_block(&shaped).await
    }

    /// Insert a block produced by the parsing pipeline.
    #[inline]
    pub async fn write_new_parsing_record(&self, block: &Block) -> Result<String> {
        let shaped = schema::shape_parsing_record(block)?;
        self.index.insert_block(&shaped).await
    }

    #[inline]
    pub async fn update_one_record(
        &self,
        filters: &[Filter],
        key: &str,
        value: impl Into<Value>,
    ) -> Result<u64> {
        let spec = schema::filterable_field(key)?;
        if spec.kind == schema::FieldKind::Key {
            return Err(IndexError::Config("Block keys cannot be updated".to_string()));
        }
        self.index
            .update_one_record(filters, key, &value.into())
            .await
    }

    #[inline]
    pub async fn replace_record(&self, filters: &[Filter], block: &Block) -> Result<String> {
        let shaped = schema::shape_block(block)?;
        self.index.replace_record(filters, &shaped).await
    }

    #[inline]
    pub async fn delete_record_by_key(
        &self,
        key: &str,
        value: impl Into<FieldValue>,
    ) -> Result<u64> {
        schema::filterable_field(key)?;
        self.index.delete_record_by_key(key, &value.into()).await
    }

    #[inline]
    pub async fn add_new_embedding_flag(
        &self,
        id: &str,
        flag_key: &str,
        token: &Value,
    ) -> Result<()> {
        self.index.add_new_embedding_flag(id, flag_key, token).await
    }

    #[inline]
    pub async fn unset_embedding_flag(&self, flag_key: &str) -> Result<u64> {
        let touched = self.index.unset_embedding_flag(flag_key).await?;
        info!(
            "Removed embedding flag {} from {} blocks in {}",
            flag_key,
            touched,
            self.index.collection_name()
        );
        Ok(touched)
    }

    #[inline]
    pub async fn add_embedding_flags(
        &self,
        flag_key: &str,
        flags: &[(String, Value)],
    ) -> Result<()> {
        self.index.add_embedding_flags(flag_key, flags).await
    }

    /// Merge `record` into the card's embedding ledger (or remove it when `delete` is set).
    #[inline]
    pub async fn update_library_card(
        &self,
        record: EmbeddingRecord,
        delete: bool,
    ) -> Result<LibraryCard> {
        self.index.merge_embedding_record(record, delete).await
    }

    #[inline]
    pub async fn update_card_counts(&self, card: &LibraryCard) -> Result<()> {
        self.index.update_card_counts(card).await
    }

    #[inline]
    pub async fn save_library_card(&self, card: &LibraryCard) -> Result<()> {
        self.index.save_library_card(card).await
    }

    #[inline]
    pub async fn get_and_increment_doc_id(&self) -> Result<i64> {
        self.index.get_and_increment_doc_id().await
    }

    #[inline]
    pub async fn build_text_index(&self) -> Result<()> {
        self.index.build_text_index().await
    }

    #[inline]
    pub async fn check_if_table_build_required(&self) -> Result<bool> {
        self.index.check_if_table_build_required().await
    }

    #[inline]
    pub async fn create_table(&self, name: &str, columns: &[ColumnSpec]) -> Result<()> {
        self.index.create_table(name, columns).await
    }

    #[inline]
    pub async fn delete_collection(&self) -> Result<()> {
        self.index.delete_collection().await
    }
}
