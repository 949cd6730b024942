//! Ordered block field list and the routines every backend shares to
//! validate names, shape inserts, render filters and decode rows.

#[cfg(test)]
mod tests;

use chrono::Utc;
use itertools::Itertools;
use serde_json::{Map, Value};

use super::model::{Block, FieldValue, Filter};
use crate::{IndexError, Result};

pub const KEY_FIELD: &str = "_id";
pub const FLAGS_FIELD: &str = "embedding_flags";
pub const SEARCH_FIELD: &str = "text_search";
pub const LIBRARY_CARDS_TABLE: &str = "library_cards";

/// Longest identifier accepted by every backend (Postgres truncates at 63 bytes).
pub const MAX_NAME_LEN: usize = 63;

/// Names owned by the index itself or by the backends' catalogs.
pub const RESERVED_NAMES: &[&str] = &[
    LIBRARY_CARDS_TABLE,
    "embedding_status",
    "sqlite_master",
    "sqlite_sequence",
    "sqlite_schema",
    "information_schema",
    "pg_catalog",
    "public",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Backend-native unique key, rendered as a string
    Key,
    Integer,
    Text,
    /// JSON map of flag key to completion token
    Flags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
}

const fn field(name: &'static str, kind: FieldKind) -> FieldSpec {
    FieldSpec { name, kind }
}

/// Block fields in storage order. Every relational row decodes positionally against this list.
pub const BLOCK_FIELDS: [FieldSpec; 28] = [
    field(KEY_FIELD, FieldKind::Key),
    field("block_ID", FieldKind::Integer),
    field("doc_ID", FieldKind::Integer),
    field("content_type", FieldKind::Text),
    field("file_type", FieldKind::Text),
    field("page_num", FieldKind::Integer),
    field("coords_x", FieldKind::Integer),
    field("coords_y", FieldKind::Integer),
    field("coords_cx", FieldKind::Integer),
    field("coords_cy", FieldKind::Integer),
    field("author_or_speaker", FieldKind::Text),
    field("added_to_collection", FieldKind::Text),
    field("file_source", FieldKind::Text),
    field("table", FieldKind::Text),
    field("modified_date", FieldKind::Text),
    field("created_date", FieldKind::Text),
    field("creator_tool", FieldKind::Text),
    field("external_files", FieldKind::Text),
    field("text", FieldKind::Text),
    field("header_text", FieldKind::Text),
    field(SEARCH_FIELD, FieldKind::Text),
    field("user_tags", FieldKind::Text),
    field("special_field1", FieldKind::Text),
    field("special_field2", FieldKind::Text),
    field("special_field3", FieldKind::Text),
    field("graph_status", FieldKind::Text),
    field("dialog", FieldKind::Text),
    field(FLAGS_FIELD, FieldKind::Flags),
];

#[inline]
pub fn field_spec(name: &str) -> Option<&'static FieldSpec> {
    BLOCK_FIELDS.iter().find(|spec| spec.name == name)
}

/// Fields written on insert, i.e. everything except the backend-assigned key.
#[inline]
pub fn insert_fields() -> impl Iterator<Item = &'static FieldSpec> {
    BLOCK_FIELDS.iter().filter(|spec| spec.kind != FieldKind::Key)
}

#[inline]
pub fn default_value(kind: FieldKind) -> Value {
    match kind {
        FieldKind::Key | FieldKind::Text => Value::from(""),
        FieldKind::Integer => Value::from(0),
        FieldKind::Flags => Value::Object(Map::new()),
    }
}

/// Resolve a field name that callers may filter or select on.
#[inline]
pub fn filterable_field(name: &str) -> Result<&'static FieldSpec> {
    match field_spec(name) {
        Some(spec) if spec.kind != FieldKind::Flags => Ok(spec),
        Some(_) => Err(IndexError::Config(format!(
            "Field {} cannot be used as a filter key",
            name
        ))),
        None => Err(IndexError::Config(format!("Unknown block field: {}", name))),
    }
}

fn coerce_value(spec: &FieldSpec, value: &FieldValue) -> Result<FieldValue> {
    match spec.kind {
        FieldKind::Integer => value.as_i64().map(FieldValue::Int).ok_or_else(|| {
            IndexError::Config(format!(
                "Field {} expects an integer, got {:?}",
                spec.name, value
            ))
        }),
        FieldKind::Key | FieldKind::Text => Ok(FieldValue::Text(value.to_string())),
        FieldKind::Flags => Err(IndexError::Config(format!(
            "Field {} cannot be used as a filter key",
            spec.name
        ))),
    }
}

/// Validate every filter key against the field list and coerce values to the field's kind.
pub fn normalize_filters(filters: &[Filter]) -> Result<Vec<Filter>> {
    filters
        .iter()
        .map(|filter| {
            let spec = filterable_field(filter.key())?;
            let key = spec.name.to_string();
            Ok(match filter {
                Filter::Equals { value, .. } => Filter::Equals {
                    key,
                    value: coerce_value(spec, value)?,
                },
                Filter::NotEquals { value, .. } => Filter::NotEquals {
                    key,
                    value: coerce_value(spec, value)?,
                },
                Filter::OneOf { values, .. } => Filter::OneOf {
                    key,
                    values: values
                        .iter()
                        .map(|v| coerce_value(spec, v))
                        .collect::<Result<_>>()?,
                },
                Filter::Range { low, high, .. } => Filter::Range {
                    key,
                    low: coerce_value(spec, low)?,
                    high: coerce_value(spec, high)?,
                },
            })
        })
        .collect()
}

/// Shape a parsed block for insertion: reject unknown fields, coerce kinds, fill defaults.
/// The key is dropped because every backend assigns its own.
pub fn shape_block(block: &Block) -> Result<Block> {
    if let Some(unknown) = block.as_map().keys().find(|k| field_spec(k).is_none()) {
        return Err(IndexError::Config(format!("Unknown block field: {}", unknown)));
    }

    let mut shaped = Map::with_capacity(BLOCK_FIELDS.len());
    for spec in insert_fields() {
        let value = match block.get(spec.name) {
            None | Some(Value::Null) => default_value(spec.kind),
            Some(value) => coerce_json(spec, value)?,
        };
        shaped.insert(spec.name.to_string(), value);
    }
    Ok(Block::from_map(shaped))
}

fn coerce_json(spec: &FieldSpec, value: &Value) -> Result<Value> {
    match spec.kind {
        FieldKind::Integer => FieldValue::from_json(value)
            .and_then(|v| v.as_i64())
            .map(Value::from)
            .ok_or_else(|| {
                IndexError::Config(format!(
                    "Field {} expects an integer, got {}",
                    spec.name, value
                ))
            }),
        FieldKind::Key | FieldKind::Text => Ok(match value {
            Value::String(s) => Value::from(s.as_str()),
            other => Value::from(other.to_string()),
        }),
        FieldKind::Flags => match value {
            Value::Object(_) => Ok(value.clone()),
            Value::String(s) if s.trim().is_empty() => Ok(default_value(FieldKind::Flags)),
            Value::String(s) => {
                let mut flags = Map::new();
                flags.insert(s.clone(), Value::from(s.as_str()));
                Ok(Value::Object(flags))
            }
            other => Err(IndexError::Config(format!(
                "Field {} expects a JSON object, got {}",
                spec.name, other
            ))),
        },
    }
}

/// Shape a block from the parsing pipeline, stamping `added_to_collection` when absent.
#[inline]
pub fn shape_parsing_record(block: &Block) -> Result<Block> {
    let mut shaped = shape_block(block)?;
    if shaped.get_str("added_to_collection").unwrap_or_default().is_empty() {
        shaped.set(
            "added_to_collection",
            Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
        );
    }
    Ok(shaped)
}

/// Decode one row into a block by reading each field in storage order.
pub fn decode_block<F>(mut read: F) -> Result<Block>
where
    F: FnMut(usize, &FieldSpec) -> Result<Value>,
{
    let mut map = Map::with_capacity(BLOCK_FIELDS.len());
    for (idx, spec) in BLOCK_FIELDS.iter().enumerate() {
        let value = read(idx, spec)?;
        map.insert(spec.name.to_string(), value);
    }
    Ok(Block::from_map(map))
}

/// Normalize a collection or table name and reject reserved or illegal ones.
///
/// Lowercases and maps `-`, `.` and spaces to `_`; anything else outside `[a-z0-9_]` is rejected.
pub fn safe_name(name: &str) -> Result<String> {
    let normalized: String = name
        .trim()
        .chars()
        .map(|c| match c {
            '-' | '.' | ' ' => '_',
            other => other.to_ascii_lowercase(),
        })
        .collect();

    if normalized.is_empty() {
        return Err(IndexError::InvalidName("name cannot be empty".to_string()));
    }
    if normalized.len() > MAX_NAME_LEN {
        return Err(IndexError::InvalidName(format!(
            "{} is longer than {} characters",
            name, MAX_NAME_LEN
        )));
    }
    if !normalized
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(IndexError::InvalidName(format!(
            "{} contains characters other than letters, digits, '-' and '_'",
            name
        )));
    }
    if normalized.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(IndexError::InvalidName(format!(
            "{} must not start with a digit",
            name
        )));
    }
    if RESERVED_NAMES.contains(&normalized.as_str()) || normalized.ends_with("_fts") {
        return Err(IndexError::InvalidName(format!("{} is reserved", name)));
    }
    Ok(normalized)
}

#[inline]
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quoted, comma-separated block columns in storage order.
#[inline]
pub fn column_list() -> String {
    BLOCK_FIELDS.iter().map(|spec| quote_ident(spec.name)).join(", ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Sqlite,
    Postgres,
}

impl Dialect {
    #[inline]
    fn placeholder(self, n: usize) -> String {
        match self {
            Self::Sqlite => "?".to_string(),
            Self::Postgres => format!("${}", n),
        }
    }
}

/// A rendered `WHERE` body with its bind values in placeholder order.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlWhere {
    pub clause: String,
    pub binds: Vec<FieldValue>,
}

impl SqlWhere {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.clause.is_empty()
    }

    /// `WHERE ...` or nothing
    #[inline]
    pub fn where_sql(&self) -> String {
        if self.clause.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.clause)
        }
    }

    /// `AND ...` or nothing, for appending to an existing condition
    #[inline]
    pub fn and_sql(&self) -> String {
        if self.clause.is_empty() {
            String::new()
        } else {
            format!(" AND {}", self.clause)
        }
    }
}

/// Render normalized filters as a conjunctive SQL condition.
///
/// `next_placeholder` is the number of the first Postgres placeholder to use and is
/// advanced past the placeholders consumed.
pub fn render_where(
    filters: &[Filter],
    dialect: Dialect,
    next_placeholder: &mut usize,
) -> Result<SqlWhere> {
    let filters = normalize_filters(filters)?;
    let mut clauses = Vec::with_capacity(filters.len());
    let mut binds = Vec::new();

    let mut bind = |value: &FieldValue, key: &str, binds: &mut Vec<FieldValue>| -> Result<String> {
        binds.push(relational_value(key, value)?);
        let placeholder = dialect.placeholder(*next_placeholder);
        *next_placeholder += 1;
        Ok(placeholder)
    };

    for filter in &filters {
        let column = quote_ident(filter.key());
        let clause = match filter {
            Filter::Equals { key, value } => format!("{} = {}", column, bind(value, key, &mut binds)?),
            Filter::NotEquals { key, value } => {
                format!("{} <> {}", column, bind(value, key, &mut binds)?)
            }
            Filter::OneOf { key, values } => {
                if values.is_empty() {
                    "1 = 0".to_string()
                } else {
                    let placeholders = values
                        .iter()
                        .map(|v| bind(v, key, &mut binds))
                        .collect::<Result<Vec<_>>>()?;
                    format!("{} IN ({})", column, placeholders.join(", "))
                }
            }
            Filter::Range { key, low, high } => {
                let low = bind(low, key, &mut binds)?;
                let high = bind(high, key, &mut binds)?;
                format!("{} BETWEEN {} AND {}", column, low, high)
            }
        };
        clauses.push(clause);
    }

    Ok(SqlWhere {
        clause: clauses.join(" AND "),
        binds,
    })
}

/// Relational keys are integers; everything else is already coerced.
fn relational_value(key: &str, value: &FieldValue) -> Result<FieldValue> {
    if key != KEY_FIELD {
        return Ok(value.clone());
    }
    value
        .as_i64()
        .map(FieldValue::Int)
        .ok_or_else(|| IndexError::Config(format!("Block id {} is not an integer key", value)))
}

/// Parse a string block id into a relational row key.
#[inline]
pub fn parse_row_id(id: &str) -> Result<i64> {
    id.trim()
        .parse()
        .map_err(|_| IndexError::Config(format!("Block id {} is not an integer key", id)))
}
