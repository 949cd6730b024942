#[cfg(test)]
mod tests;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A scalar value of a block field used in filters and distinct lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Int(i64),
    Text(String),
}

impl FieldValue {
    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    #[inline]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Int(i) => Value::from(*i),
            Self::Text(s) => Value::from(s.as_str()),
        }
    }

    /// Convert a JSON scalar. Objects, arrays and null have no field value.
    #[inline]
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .map(Self::Int)
                .or_else(|| Some(Self::Text(n.to_string()))),
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Bool(b) => Some(Self::Int(i64::from(*b))),
            _ => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{}", i),
            Self::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Right-hand side of a key/value dictionary filter: one value or a value set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterValue {
    One(FieldValue),
    Many(Vec<FieldValue>),
}

/// A single constraint on a block field. Filters in a slice are conjunctive.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Equals { key: String, value: FieldValue },
    OneOf { key: String, values: Vec<FieldValue> },
    NotEquals { key: String, value: FieldValue },
    /// Inclusive on both ends
    Range {
        key: String,
        low: FieldValue,
        high: FieldValue,
    },
}

impl Filter {
    #[inline]
    pub fn equals(key: &str, value: impl Into<FieldValue>) -> Self {
        Self::Equals {
            key: key.to_string(),
            value: value.into(),
        }
    }

    #[inline]
    pub fn one_of(key: &str, values: Vec<FieldValue>) -> Self {
        Self::OneOf {
            key: key.to_string(),
            values,
        }
    }

    #[inline]
    pub fn not_equals(key: &str, value: impl Into<FieldValue>) -> Self {
        Self::NotEquals {
            key: key.to_string(),
            value: value.into(),
        }
    }

    #[inline]
    pub fn range(key: &str, low: impl Into<FieldValue>, high: impl Into<FieldValue>) -> Self {
        Self::Range {
            key: key.to_string(),
            low: low.into(),
            high: high.into(),
        }
    }

    #[inline]
    pub fn key(&self) -> &str {
        match self {
            Self::Equals { key, .. }
            | Self::OneOf { key, .. }
            | Self::NotEquals { key, .. }
            | Self::Range { key, .. } => key,
        }
    }

    /// Build filters from a `{key: value | [values]}` dictionary.
    #[inline]
    pub fn from_dict<'a, I>(dict: I) -> Vec<Self>
    where
        I: IntoIterator<Item = (&'a String, &'a FilterValue)>,
    {
        dict.into_iter()
            .map(|(key, value)| match value {
                FilterValue::One(v) => Self::equals(key, v.clone()),
                FilterValue::Many(vs) => Self::one_of(key, vs.clone()),
            })
            .collect()
    }
}

/// One indexed text, table or image fragment, keyed by field name.
///
/// `_id` is always rendered as a string whatever the backend key type is.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Block(Map<String, Value>);

impl Block {
    #[inline]
    pub fn new() -> Self {
        Self(Map::new())
    }

    #[inline]
    pub fn from_map(map: Map<String, Value>) -> Self {
        Self(map)
    }

    #[inline]
    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.0.insert(key.to_string(), value.into());
        self
    }

    #[inline]
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    #[inline]
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    #[inline]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[inline]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    #[inline]
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.0.get(key).and_then(|v| match v {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        })
    }

    #[inline]
    pub fn id(&self) -> &str {
        self.get_str("_id").unwrap_or_default()
    }

    #[inline]
    pub fn doc_id(&self) -> Option<i64> {
        self.get_i64("doc_ID")
    }

    #[inline]
    pub fn block_id(&self) -> Option<i64> {
        self.get_i64("block_ID")
    }

    #[inline]
    pub fn text_search(&self) -> &str {
        self.get_str("text_search").unwrap_or_default()
    }

    /// The completion token stored under `flag_key`, if the block carries it.
    #[inline]
    pub fn embedding_flag(&self, flag_key: &str) -> Option<&Value> {
        self.0
            .get("embedding_flags")
            .and_then(Value::as_object)
            .and_then(|flags| flags.get(flag_key))
    }

    #[inline]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    #[inline]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }
}

/// One entry of a library's embedding ledger, keyed by (embedding_model, embedding_db).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub embedding_model: String,
    pub embedding_db: String,
    pub embedding_dims: u32,
    pub embedded_blocks: u64,
    pub embedding_status: String,
    pub time_stamp: String,
}

impl EmbeddingRecord {
    /// The "no embedding yet" entry a fresh library card carries.
    #[inline]
    pub fn placeholder() -> Self {
        Self {
            embedding_model: "none".to_string(),
            embedding_db: "none".to_string(),
            embedding_dims: 0,
            embedded_blocks: 0,
            embedding_status: "no".to_string(),
            time_stamp: String::new(),
        }
    }

    #[inline]
    pub fn completed(model: &str, engine: &str, dims: u32, embedded_blocks: u64) -> Self {
        Self {
            embedding_model: model.to_string(),
            embedding_db: engine.to_string(),
            embedding_dims: dims,
            embedded_blocks,
            embedding_status: "yes".to_string(),
            time_stamp: Utc::now().to_rfc3339(),
        }
    }

    #[inline]
    pub fn is_placeholder(&self) -> bool {
        self.embedding_model == "none" && self.embedding_db == "none"
    }

    #[inline]
    pub fn same_target(&self, other: &Self) -> bool {
        self.embedding_model == other.embedding_model && self.embedding_db == other.embedding_db
    }
}

/// Per-library record: identity, running counts and the embedding ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryCard {
    pub library_name: String,
    pub account_name: String,
    pub documents: u64,
    pub blocks: u64,
    pub images: u64,
    pub pages: u64,
    pub tables: u64,
    pub unique_doc_id: i64,
    pub embedding: Vec<EmbeddingRecord>,
}

impl LibraryCard {
    #[inline]
    pub fn new(library_name: &str, account_name: &str) -> Self {
        Self {
            library_name: library_name.to_string(),
            account_name: account_name.to_string(),
            documents: 0,
            blocks: 0,
            images: 0,
            pages: 0,
            tables: 0,
            unique_doc_id: 0,
            embedding: vec![EmbeddingRecord::placeholder()],
        }
    }

    /// Merge `record` into the ledger, or remove its (model, engine) entry when `delete` is set.
    ///
    /// There is at most one entry per (model, engine) pair. A real entry replaces the
    /// placeholder, and removing the last real entry brings the placeholder back.
    pub fn merge_embedding_record(&mut self, record: EmbeddingRecord, delete: bool) {
        if delete {
            self.embedding.retain(|existing| !existing.same_target(&record));
            if self.embedding.is_empty() {
                self.embedding.push(EmbeddingRecord::placeholder());
            }
            return;
        }

        self.embedding.retain(|existing| !existing.is_placeholder());
        match self
            .embedding
            .iter_mut()
            .find(|existing| existing.same_target(&record))
        {
            Some(existing) => *existing = record,
            None => self.embedding.push(record),
        }
    }

    #[inline]
    pub fn embedding_record(&self, model: &str, engine: &str) -> Option<&EmbeddingRecord> {
        self.embedding
            .iter()
            .find(|r| r.embedding_model == model && r.embedding_db == engine)
    }
}
