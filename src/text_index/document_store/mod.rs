#[cfg(test)]
mod tests;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};
use tantivy::collector::{Count, TopDocs};
use tantivy::query::{
    AllQuery, BooleanQuery, ConstScoreQuery, EmptyQuery, Occur, Query, RangeQuery, TermQuery,
};
use tantivy::schema::{
    FAST, Field, INDEXED, IndexRecordOption, STORED, STRING, Schema, TextFieldIndexing,
    TextOptions, Value as _,
};
use tantivy::{
    DocAddress, Index, IndexReader, IndexWriter, Order, ReloadPolicy, Searcher, TantivyDocument,
    Term,
};
use tracing::{debug, info};
use uuid::Uuid;

use super::analyzer;
use super::cursor::Cursor;
use super::model::{Block, EmbeddingRecord, FieldValue, Filter, LibraryCard};
use super::schema::{
    self, FLAGS_FIELD, FieldKind, KEY_FIELD, LIBRARY_CARDS_TABLE, SEARCH_FIELD,
};
use super::TextIndex;
use crate::config::TextIndexBackend;
use crate::{IndexError, Result};

const SEQ_FIELD: &str = "_seq";
const SOURCE_FIELD: &str = "_source";
const FLAG_KEYS_FIELD: &str = "embedding_keys";
const FLAG_PAIRS_FIELD: &str = "embedding_flag_pairs";

const WRITER_HEAP_BYTES: usize = 50_000_000;
const CARD_WRITER_HEAP_BYTES: usize = 15_000_000;

/// Serializes library card updates across every store in the process.
static CARD_LOCK: Mutex<()> = Mutex::new(());

fn tantivy_error<E: std::fmt::Display>(action: &'static str) -> impl Fn(E) -> IndexError {
    move |e| IndexError::TextIndex(format!("Failed to {}: {}", action, e))
}

fn block_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field(KEY_FIELD, STRING | STORED);
    builder.add_i64_field(SEQ_FIELD, INDEXED | FAST | STORED);
    builder.add_text_field(SOURCE_FIELD, STORED);

    let search_options = TextOptions::default().set_indexing_options(
        TextFieldIndexing::default()
            .set_tokenizer(analyzer::ANALYZER_NAME)
            .set_index_option(IndexRecordOption::WithFreqsAndPositions),
    );

    for spec in schema::insert_fields() {
        match spec.kind {
            FieldKind::Integer => {
                builder.add_i64_field(spec.name, INDEXED | FAST);
            }
            FieldKind::Text if spec.name == SEARCH_FIELD => {
                builder.add_text_field(spec.name, search_options.clone());
            }
            FieldKind::Text | FieldKind::Key => {
                builder.add_text_field(spec.name, STRING);
            }
            FieldKind::Flags => {
                builder.add_text_field(FLAG_KEYS_FIELD, STRING);
                builder.add_text_field(FLAG_PAIRS_FIELD, STRING);
            }
        }
    }
    builder.build()
}

fn card_schema() -> Schema {
    let mut builder = Schema::builder();
    builder.add_text_field("library", STRING | STORED);
    builder.add_text_field("card", STORED);
    builder.build()
}

fn field(schema: &Schema, name: &str) -> Result<Field> {
    schema
        .get_field(name)
        .map_err(|e| IndexError::TextIndex(format!("Missing field {}: {}", name, e)))
}

/// Indexed form of one flag entry, used to resolve a token back to its block.
fn flag_pair(flag_key: &str, token: &Value) -> String {
    match token {
        Value::String(s) => format!("{}={}", flag_key, s),
        other => format!("{}={}", flag_key, other),
    }
}

fn open_or_create(dir: &Path, schema: Schema) -> Result<Index> {
    std::fs::create_dir_all(dir)?;
    if dir.join("meta.json").exists() {
        Index::open_in_dir(dir).map_err(tantivy_error("open document index"))
    } else {
        Index::create_in_dir(dir, schema).map_err(tantivy_error("create document index"))
    }
}

struct Collection {
    index: Index,
    reader: IndexReader,
    writer: Option<IndexWriter>,
}

impl Collection {
    fn open(dir: &Path) -> Result<Self> {
        let index = open_or_create(dir, block_schema())?;
        index
            .tokenizers()
            .register(analyzer::ANALYZER_NAME, analyzer::search_analyzer());
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()
            .map_err(tantivy_error("open document reader"))?;
        Ok(Self {
            index,
            reader,
            writer: None,
        })
    }

    fn writer(&mut self) -> Result<&mut IndexWriter> {
        if self.writer.is_none() {
            let writer = self
                .index
                .writer(WRITER_HEAP_BYTES)
                .map_err(tantivy_error("open document writer"))?;
            self.writer = Some(writer);
        }
        self.writer
            .as_mut()
            .ok_or_else(|| IndexError::TextIndex("Document writer unavailable".to_string()))
    }
}

/// Block stored in the document index with the extra bookkeeping it needs.
struct StoredBlock {
    id: String,
    seq: i64,
    block: Block,
}

/// Embedded document-store backend built on tantivy.
///
/// Each library is its own index directory under the account directory. Blocks keep
/// their full JSON in a stored `_source` field; typed copies of the block fields are
/// indexed for filtering, and `text_search` is indexed with English stemming.
pub struct DocumentStore {
    dir: PathBuf,
    cards_dir: PathBuf,
    account_name: String,
    collection: String,
    state: Mutex<Option<Collection>>,
    last_seq: AtomicI64,
}

impl std::fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentStore")
            .field("dir", &self.dir)
            .field("collection", &self.collection)
            .finish_non_exhaustive()
    }
}

impl DocumentStore {
    pub fn open(account_dir: &Path, account_name: &str, collection: &str) -> Result<Self> {
        std::fs::create_dir_all(account_dir)?;
        Ok(Self {
            dir: account_dir.join(collection),
            cards_dir: account_dir.join(LIBRARY_CARDS_TABLE),
            account_name: account_name.to_string(),
            collection: collection.to_string(),
            state: Mutex::new(None),
            last_seq: AtomicI64::new(0),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Option<Collection>>> {
        self.state
            .lock()
            .map_err(|_| IndexError::TextIndex("Document store lock poisoned".to_string()))
    }

    fn is_built(&self) -> bool {
        self.dir.join("meta.json").exists()
    }

    /// Run `f` against the opened collection. Fails if the collection was never built.
    fn with_collection<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Collection) -> Result<T>,
    {
        let mut state = self.lock()?;
        if state.is_none() {
            if !self.is_built() {
                return Err(IndexError::TextIndex(format!(
                    "Collection {} has not been built",
                    self.collection
                )));
            }
            *state = Some(Collection::open(&self.dir)?);
        }
        match state.as_mut() {
            Some(collection) => f(collection),
            None => Err(IndexError::TextIndex("Document store unavailable".to_string())),
        }
    }

    fn searcher(&self) -> Result<Searcher> {
        self.with_collection(|c| Ok(c.reader.searcher()))
    }

    /// Apply `f` with the writer, then commit and make the change visible.
    fn write<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&IndexWriter, &Schema) -> Result<()>,
    {
        self.with_collection(|c| {
            let schema = c.index.schema();
            let writer = c.writer()?;
            f(writer, &schema)?;
            writer.commit().map_err(tantivy_error("commit documents"))?;
            c.reader.reload().map_err(tantivy_error("reload documents"))
        })
    }

    fn next_seq(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let previous = self
            .last_seq
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now.max(last + 1))
            })
            .unwrap_or(now);
        now.max(previous + 1)
    }

    fn to_document(schema: &Schema, stored: &StoredBlock) -> Result<TantivyDocument> {
        let mut doc = TantivyDocument::default();
        doc.add_text(field(schema, KEY_FIELD)?, &stored.id);
        doc.add_i64(field(schema, SEQ_FIELD)?, stored.seq);

        for spec in schema::insert_fields() {
            match spec.kind {
                FieldKind::Integer => doc.add_i64(
                    field(schema, spec.name)?,
                    stored.block.get_i64(spec.name).unwrap_or_default(),
                ),
                FieldKind::Key | FieldKind::Text => doc.add_text(
                    field(schema, spec.name)?,
                    stored.block.get_str(spec.name).unwrap_or_default(),
                ),
                FieldKind::Flags => {
                    let keys = field(schema, FLAG_KEYS_FIELD)?;
                    let pairs = field(schema, FLAG_PAIRS_FIELD)?;
                    if let Some(flags) = stored.block.get(FLAGS_FIELD).and_then(Value::as_object) {
                        for (key, token) in flags {
                            doc.add_text(keys, key);
                            doc.add_text(pairs, flag_pair(key, token));
                        }
                    }
                }
            }
        }

        let mut source = stored.block.clone();
        source.set(KEY_FIELD, stored.id.clone());
        doc.add_text(
            field(schema, SOURCE_FIELD)?,
            serde_json::to_string(source.as_map())?,
        );
        Ok(doc)
    }

    fn load(searcher: &Searcher, address: DocAddress) -> Result<StoredBlock> {
        let doc: TantivyDocument = searcher
            .doc(address)
            .map_err(tantivy_error("load document"))?;
        let schema = searcher.schema();

        let seq = doc
            .get_first(field(schema, SEQ_FIELD)?)
            .and_then(|v| v.as_i64())
            .unwrap_or_default();
        let raw = doc
            .get_first(field(schema, SOURCE_FIELD)?)
            .and_then(|v| v.as_str())
            .ok_or_else(|| IndexError::TextIndex("Document has no stored source".to_string()))?;
        let source: Map<String, Value> = serde_json::from_str(raw)?;

        let block = schema::decode_block(|_, spec| {
            Ok(source
                .get(spec.name)
                .cloned()
                .unwrap_or_else(|| schema::default_value(spec.kind)))
        })?;
        Ok(StoredBlock {
            id: block.id().to_string(),
            seq,
            block,
        })
    }

    /// Matching addresses in insertion order.
    fn addresses(searcher: &Searcher, query: &dyn Query) -> Result<Vec<DocAddress>> {
        let limit = usize::try_from(searcher.num_docs()).unwrap_or(usize::MAX).max(1);
        let hits: Vec<(i64, DocAddress)> = searcher
            .search(
                query,
                &TopDocs::with_limit(limit).order_by_fast_field::<i64>(SEQ_FIELD, Order::Asc),
            )
            .map_err(tantivy_error("search documents"))?;
        Ok(hits.into_iter().map(|(_, address)| address).collect())
    }

    fn matching(&self, query: &dyn Query) -> Result<Vec<StoredBlock>> {
        let searcher = self.searcher()?;
        Self::addresses(&searcher, query)?
            .into_iter()
            .map(|address| Self::load(&searcher, address))
            .collect()
    }

    /// Lazily load blocks from a fixed snapshot.
    fn snapshot_cursor(&self, query: &dyn Query) -> Result<(u64, Cursor)> {
        let searcher = self.searcher()?;
        let addresses = Self::addresses(&searcher, query)?;
        let count = addresses.len() as u64;
        let rows = stream::iter(addresses)
            .map(move |address| Self::load(&searcher, address).map(|stored| stored.block));
        Ok((count, Cursor::new(rows.boxed(), true)))
    }

    fn term_query(term: Term) -> Box<dyn Query> {
        Box::new(TermQuery::new(term, IndexRecordOption::Basic))
    }

    fn value_term(schema: &Schema, key: &str, value: &FieldValue) -> Result<Term> {
        let spec = schema::filterable_field(key)?;
        let field = field(schema, spec.name)?;
        match spec.kind {
            FieldKind::Integer => value.as_i64().map(|v| Term::from_field_i64(field, v)).ok_or_else(|| {
                IndexError::Config(format!("Field {} expects an integer", spec.name))
            }),
            _ => Ok(Term::from_field_text(field, &value.to_string())),
        }
    }

    fn filter_query(schema: &Schema, filter: &Filter) -> Result<Box<dyn Query>> {
        Ok(match filter {
            Filter::Equals { key, value } => Self::term_query(Self::value_term(schema, key, value)?),
            Filter::NotEquals { key, value } => Box::new(BooleanQuery::new(vec![
                (Occur::Must, Box::new(AllQuery) as Box<dyn Query>),
                (
                    Occur::MustNot,
                    Self::term_query(Self::value_term(schema, key, value)?),
                ),
            ])),
            Filter::OneOf { key, values } => {
                if values.is_empty() {
                    Box::new(EmptyQuery)
                } else {
                    let clauses = values
                        .iter()
                        .map(|v| -> Result<(Occur, Box<dyn Query>)> {
                            Ok((Occur::Should, Self::term_query(Self::value_term(schema, key, v)?)))
                        })
                        .collect::<Result<Vec<_>>>()?;
                    Box::new(BooleanQuery::new(clauses))
                }
            }
            Filter::Range { key, low, high } => {
                let spec = schema::filterable_field(key)?;
                if spec.kind == FieldKind::Integer {
                    let bound = |v: &FieldValue| {
                        v.as_i64().ok_or_else(|| {
                            IndexError::Config(format!("Field {} expects an integer", key))
                        })
                    };
                    Box::new(RangeQuery::new_i64_bounds(
                        spec.name.to_string(),
                        Bound::Included(bound(low)?),
                        Bound::Included(bound(high)?),
                    ))
                } else {
                    let low = low.to_string();
                    let high = high.to_string();
                    Box::new(RangeQuery::new_str_bounds(
                        spec.name.to_string(),
                        Bound::Included(low.as_str()),
                        Bound::Included(high.as_str()),
                    ))
                }
            }
        })
    }

    /// Conjunction of `filters`, scoring nothing. No filters matches everything.
    fn filters_query(schema: &Schema, filters: &[Filter]) -> Result<Box<dyn Query>> {
        let filters = schema::normalize_filters(filters)?;
        if filters.is_empty() {
            return Ok(Box::new(AllQuery));
        }
        let clauses = filters
            .iter()
            .map(|f| -> Result<(Occur, Box<dyn Query>)> {
                let query: Box<dyn Query> =
                    Box::new(ConstScoreQuery::new(Self::filter_query(schema, f)?, 0.0));
                Ok((Occur::Must, query))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn schema(&self) -> Result<Schema> {
        self.with_collection(|c| Ok(c.index.schema()))
    }

    fn rewrite(&self, blocks: &[StoredBlock]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        self.write(|writer, schema| {
            let key = field(schema, KEY_FIELD)?;
            for stored in blocks {
                writer.delete_term(Term::from_field_text(key, &stored.id));
                writer
                    .add_document(Self::to_document(schema, stored)?)
                    .map_err(tantivy_error("write document"))?;
            }
            Ok(())
        })
    }

    fn flag_keys_query(schema: &Schema, flag_key: &str) -> Result<Box<dyn Query>> {
        Ok(Self::term_query(Term::from_field_text(
            field(schema, FLAG_KEYS_FIELD)?,
            flag_key,
        )))
    }

    fn read_card(&self) -> Result<Option<LibraryCard>> {
        if !self.cards_dir.join("meta.json").exists() {
            return Ok(None);
        }
        let index = open_or_create(&self.cards_dir, card_schema())?;
        let schema = index.schema();
        let reader = index.reader().map_err(tantivy_error("open card reader"))?;
        let searcher = reader.searcher();

        let query = TermQuery::new(
            Term::from_field_text(field(&schema, "library")?, &self.collection),
            IndexRecordOption::Basic,
        );
        let hits = searcher
            .search(&query, &TopDocs::with_limit(1))
            .map_err(tantivy_error("search library cards"))?;
        let Some((_, address)) = hits.into_iter().next() else {
            return Ok(None);
        };

        let doc: TantivyDocument = searcher
            .doc(address)
            .map_err(tantivy_error("load library card"))?;
        let raw = doc
            .get_first(field(&schema, "card")?)
            .and_then(|v| v.as_str())
            .ok_or_else(|| IndexError::TextIndex("Library card has no body".to_string()))?;
        Ok(Some(serde_json::from_str(raw)?))
    }

    /// Replace (or with `None`, remove) this library's card.
    fn write_card(&self, card: Option<&LibraryCard>) -> Result<()> {
        let index = open_or_create(&self.cards_dir, card_schema())?;
        let schema = index.schema();
        let library = field(&schema, "library")?;
        let body = field(&schema, "card")?;

        let mut writer: IndexWriter = index
            .writer_with_num_threads(1, CARD_WRITER_HEAP_BYTES)
            .map_err(tantivy_error("open card writer"))?;
        writer.delete_term(Term::from_field_text(library, &self.collection));
        if let Some(card) = card {
            let mut doc = TantivyDocument::default();
            doc.add_text(library, &self.collection);
            doc.add_text(body, serde_json::to_string(card)?);
            writer
                .add_document(doc)
                .map_err(tantivy_error("write library card"))?;
        }
        writer.commit().map_err(tantivy_error("commit library card"))?;
        Ok(())
    }

    fn card_lock() -> Result<MutexGuard<'static, ()>> {
        CARD_LOCK
            .lock()
            .map_err(|_| IndexError::TextIndex("Library card lock poisoned".to_string()))
    }
}

#[async_trait]
impl TextIndex for DocumentStore {
    fn backend(&self) -> TextIndexBackend {
        TextIndexBackend::DocumentStore
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }

    fn account_name(&self) -> &str {
        &self.account_name
    }

    async fn check_if_table_build_required(&self) -> Result<bool> {
        Ok(!self.is_built())
    }

    async fn build_text_index(&self) -> Result<()> {
        info!("Building document store index {}", self.collection);
        let mut state = self.lock()?;
        if state.is_none() {
            *state = Some(Collection::open(&self.dir)?);
        }
        Ok(())
    }

    async fn delete_collection(&self) -> Result<()> {
        info!("Deleting document store collection {}", self.collection);
        {
            let mut state = self.lock()?;
            // dropping the collection releases the writer lock before the files go
            state.take();
        }
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }

        let _guard = Self::card_lock()?;
        if self.cards_dir.join("meta.json").exists() {
            self.write_card(None)?;
        }
        Ok(())
    }

    async fn find(&self, filters: &[Filter]) -> Result<Vec<Block>> {
        let query = Self::filters_query(&self.schema()?, filters)?;
        Ok(self
            .matching(query.as_ref())?
            .into_iter()
            .map(|stored| stored.block)
            .collect())
    }

    async fn text_search(&self, text: &str, filters: &[Filter]) -> Result<Vec<Block>> {
        let terms = analyzer::query_terms(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let searcher = self.searcher()?;
        let schema = searcher.schema().clone();
        let search_field = field(&schema, SEARCH_FIELD)?;

        let mut clauses: Vec<(Occur, Box<dyn Query>)> = terms
            .iter()
            .map(|term| {
                let query: Box<dyn Query> = Box::new(TermQuery::new(
                    Term::from_field_text(search_field, term),
                    IndexRecordOption::WithFreqs,
                ));
                (Occur::Must, query)
            })
            .collect();
        if !filters.is_empty() {
            clauses.push((Occur::Must, Self::filters_query(&schema, filters)?));
        }

        let limit = usize::try_from(searcher.num_docs()).unwrap_or(usize::MAX).max(1);
        let hits = searcher
            .search(&BooleanQuery::new(clauses), &TopDocs::with_limit(limit))
            .map_err(tantivy_error("search documents"))?;

        debug!("Keyword search on {} matched {} blocks", self.collection, hits.len());
        hits.into_iter()
            .map(|(_, address)| Self::load(&searcher, address).map(|stored| stored.block))
            .collect()
    }

    async fn get_whole_collection(&self) -> Result<Cursor> {
        Ok(self.snapshot_cursor(&AllQuery)?.1)
    }

    async fn count_documents(&self, filters: &[Filter]) -> Result<u64> {
        let searcher = self.searcher()?;
        let query = Self::filters_query(searcher.schema(), filters)?;
        let count = searcher
            .search(query.as_ref(), &Count)
            .map_err(tantivy_error("count documents"))?;
        Ok(count as u64)
    }

    async fn embedding_job_cursor(
        &self,
        flag_key: &str,
        doc_ids: Option<&[i64]>,
    ) -> Result<(u64, Cursor)> {
        let schema = self.schema()?;
        let query: Box<dyn Query> = match doc_ids {
            Some(ids) => Self::filters_query(
                &schema,
                &[Filter::one_of("doc_ID", ids.iter().copied().map(FieldValue::Int).collect())],
            )?,
            None => Box::new(BooleanQuery::new(vec![
                (Occur::Must, Box::new(AllQuery) as Box<dyn Query>),
                (Occur::MustNot, Self::flag_keys_query(&schema, flag_key)?),
            ])),
        };
        let (count, cursor) = self.snapshot_cursor(query.as_ref())?;
        debug!(
            "Embedding job on {} for {}: {} blocks",
            self.collection, flag_key, count
        );
        Ok((count, cursor))
    }

    async fn count_embedded_blocks(&self, flag_key: &str) -> Result<u64> {
        let searcher = self.searcher()?;
        let query = Self::flag_keys_query(searcher.schema(), flag_key)?;
        let count = searcher
            .search(query.as_ref(), &Count)
            .map_err(tantivy_error("count embedded blocks"))?;
        Ok(count as u64)
    }

    async fn get_distinct_list(&self, key: &str) -> Result<Vec<FieldValue>> {
        let spec = schema::filterable_field(key)?;
        let values: BTreeSet<FieldValue> = self
            .matching(&AllQuery)?
            .iter()
            .filter_map(|stored| stored.block.get(spec.name).and_then(FieldValue::from_json))
            .map(|value| match spec.kind {
                FieldKind::Integer => value.as_i64().map_or(value, FieldValue::Int),
                _ => FieldValue::Text(value.to_string()),
            })
            .collect();
        Ok(values.into_iter().collect())
    }

    async fn insert_block(&self, block: &Block) -> Result<String> {
        let stored = StoredBlock {
            id: Uuid::new_v4().to_string(),
            seq: self.next_seq(),
            block: block.clone(),
        };
        self.write(|writer, schema| {
            writer
                .add_document(Self::to_document(schema, &stored)?)
                .map_err(tantivy_error("write document"))?;
            Ok(())
        })?;
        Ok(stored.id)
    }

    async fn update_one_record(
        &self,
        filters: &[Filter],
        key: &str,
        value: &Value,
    ) -> Result<u64> {
        let spec = schema::filterable_field(key)?;
        let query = Self::filters_query(&self.schema()?, filters)?;
        let Some(mut stored) = self.matching(query.as_ref())?.into_iter().next() else {
            return Ok(0);
        };

        let value = match spec.kind {
            FieldKind::Integer => FieldValue::from_json(value)
                .and_then(|v| v.as_i64())
                .map(Value::from)
                .ok_or_else(|| {
                    IndexError::Config(format!("Field {} expects an integer", spec.name))
                })?,
            _ => Value::from(value.as_str().map_or_else(|| value.to_string(), str::to_string)),
        };
        stored.block.set(spec.name, value);
        self.rewrite(std::slice::from_ref(&stored))?;
        Ok(1)
    }

    async fn delete_record_by_key(&self, key: &str, value: &FieldValue) -> Result<u64> {
        let filter = Filter::Equals {
            key: key.to_string(),
            value: value.clone(),
        };
        let doomed = self.find(std::slice::from_ref(&filter)).await?;
        if doomed.is_empty() {
            return Ok(0);
        }
        self.write(|writer, schema| {
            let key_field = field(schema, KEY_FIELD)?;
            for block in &doomed {
                writer.delete_term(Term::from_field_text(key_field, block.id()));
            }
            Ok(())
        })?;
        Ok(doomed.len() as u64)
    }

    async fn add_new_embedding_flag(
        &self,
        id: &str,
        flag_key: &str,
        token: &Value,
    ) -> Result<()> {
        self.add_embedding_flags(flag_key, &[(id.to_string(), token.clone())])
            .await
    }

    async fn add_embedding_flags(&self, flag_key: &str, flags: &[(String, Value)]) -> Result<()> {
        if flags.is_empty() {
            return Ok(());
        }
        let schema = self.schema()?;
        let key = field(&schema, KEY_FIELD)?;
        let query = BooleanQuery::new(
            flags
                .iter()
                .map(|(id, _)| (Occur::Should, Self::term_query(Term::from_field_text(key, id))))
                .collect(),
        );
        let mut found = self.matching(&query)?;

        for (id, token) in flags {
            let Some(stored) = found.iter_mut().find(|stored| &stored.id == id) else {
                return Err(IndexError::TextIndex(format!(
                    "No block {} in {}",
                    id, self.collection
                )));
            };
            let mut block_flags = stored
                .block
                .get(FLAGS_FIELD)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            block_flags.insert(flag_key.to_string(), token.clone());
            stored.block.set(FLAGS_FIELD, Value::Object(block_flags));
        }
        self.rewrite(&found)
    }

    async fn unset_embedding_flag(&self, flag_key: &str) -> Result<u64> {
        let query = Self::flag_keys_query(&self.schema()?, flag_key)?;
        let mut flagged = self.matching(query.as_ref())?;
        for stored in &mut flagged {
            let mut flags = stored
                .block
                .get(FLAGS_FIELD)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default();
            flags.remove(flag_key);
            stored.block.set(FLAGS_FIELD, Value::Object(flags));
        }
        self.rewrite(&flagged)?;
        Ok(flagged.len() as u64)
    }

    async fn lookup_embedding_flag(
        &self,
        flag_key: &str,
        token: &Value,
    ) -> Result<Option<Block>> {
        let query = Self::term_query(Term::from_field_text(
            field(&self.schema()?, FLAG_PAIRS_FIELD)?,
            &flag_pair(flag_key, token),
        ));
        Ok(self
            .matching(query.as_ref())?
            .into_iter()
            .next()
            .map(|stored| stored.block))
    }

    async fn get_library_card(&self) -> Result<Option<LibraryCard>> {
        let _guard = Self::card_lock()?;
        self.read_card()
    }

    async fn save_library_card(&self, card: &LibraryCard) -> Result<()> {
        let _guard = Self::card_lock()?;
        let mut card = card.clone();
        if let Some(existing) = self.read_card()? {
            card.unique_doc_id = card.unique_doc_id.max(existing.unique_doc_id);
        }
        self.write_card(Some(&card))
    }

    async fn merge_embedding_record(
        &self,
        record: EmbeddingRecord,
        delete: bool,
    ) -> Result<LibraryCard> {
        let _guard = Self::card_lock()?;
        let mut card = self.read_card()?.ok_or_else(|| {
            IndexError::TextIndex(format!("No library card for {}", self.collection))
        })?;
        card.merge_embedding_record(record, delete);
        self.write_card(Some(&card))?;
        Ok(card)
    }

    async fn update_card_counts(&self, counts: &LibraryCard) -> Result<()> {
        let _guard = Self::card_lock()?;
        let mut card = self.read_card()?.ok_or_else(|| {
            IndexError::TextIndex(format!("No library card for {}", self.collection))
        })?;
        card.documents = counts.documents;
        card.blocks = counts.blocks;
        card.images = counts.images;
        card.pages = counts.pages;
        card.tables = counts.tables;
        self.write_card(Some(&card))
    }

    async fn get_and_increment_doc_id(&self) -> Result<i64> {
        let _guard = Self::card_lock()?;
        let mut card = self.read_card()?.ok_or_else(|| {
            IndexError::TextIndex(format!("No library card for {}", self.collection))
        })?;
        card.unique_doc_id += 1;
        self.write_card(Some(&card))?;
        Ok(card.unique_doc_id)
    }
}
