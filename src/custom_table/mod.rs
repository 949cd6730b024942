// Custom table module
// Ad hoc relational tables beside a library's block collection, loaded from CSV or JSON

#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

use crate::text_index::{TextIndex, safe_name};
use crate::{IndexError, Result};

/// Rows sampled when inferring column types.
const INFERENCE_SAMPLE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    Integer,
    Float,
    Text,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub name: String,
    pub kind: ColumnType,
}

impl ColumnSpec {
    #[inline]
    pub fn new(name: &str, kind: ColumnType) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
    Json(Value),
}

impl Cell {
    /// A CSV field. Empty strings are nulls.
    #[inline]
    pub fn parse(raw: &str, kind: ColumnType) -> Result<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::Null);
        }
        Self::Text(raw.to_string()).coerce(kind)
    }

    #[inline]
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Number(n) => n
                .as_i64()
                .map_or_else(|| Self::Float(n.as_f64().unwrap_or_default()), Self::Int),
            Value::String(s) => Self::Text(s.clone()),
            other => Self::Json(other.clone()),
        }
    }

    /// Convert to the storage form of `kind`.
    #[inline]
    pub fn coerce(self, kind: ColumnType) -> Result<Self> {
        let mismatch = |cell: &Cell| {
            IndexError::Config(format!("Value {:?} does not fit a {:?} column", cell, kind))
        };

        Ok(match (self, kind) {
            (Self::Null, _) => Self::Null,
            (Self::Int(i), ColumnType::Integer) => Self::Int(i),
            (Self::Float(f), ColumnType::Integer) if f.fract() == 0.0 => Self::Int(f as i64),
            (Self::Text(s), ColumnType::Integer) => match s.trim().parse() {
                Ok(i) => Self::Int(i),
                Err(_) => return Err(mismatch(&Self::Text(s))),
            },
            (Self::Int(i), ColumnType::Float) => Self::Float(i as f64),
            (Self::Float(f), ColumnType::Float) => Self::Float(f),
            (Self::Text(s), ColumnType::Float) => match s.trim().parse() {
                Ok(f) => Self::Float(f),
                Err(_) => return Err(mismatch(&Self::Text(s))),
            },
            (Self::Int(i), ColumnType::Text) => Self::Text(i.to_string()),
            (Self::Float(f), ColumnType::Text) => Self::Text(f.to_string()),
            (Self::Text(s), ColumnType::Text) => Self::Text(s),
            (Self::Json(v), ColumnType::Text) => Self::Text(v.to_string()),
            (Self::Text(s), ColumnType::Json) => {
                Self::Json(serde_json::from_str(&s).unwrap_or(Value::String(s)))
            }
            (Self::Int(i), ColumnType::Json) => Self::Json(Value::from(i)),
            (Self::Float(f), ColumnType::Json) => Self::Json(Value::from(f)),
            (Self::Json(v), ColumnType::Json) => Self::Json(v),
            (cell, _) => return Err(mismatch(&cell)),
        })
    }
}

fn text_kind(raw: &str) -> Option<ColumnType> {
    let raw = raw.trim();
    if raw.is_empty() {
        None
    } else if raw.parse::<i64>().is_ok() {
        Some(ColumnType::Integer)
    } else if raw.parse::<f64>().is_ok() {
        Some(ColumnType::Float)
    } else if matches!(
        serde_json::from_str::<Value>(raw),
        Ok(Value::Object(_) | Value::Array(_))
    ) {
        Some(ColumnType::Json)
    } else {
        Some(ColumnType::Text)
    }
}

fn json_kind(value: &Value) -> Option<ColumnType> {
    match value {
        Value::Null => None,
        Value::Number(n) if n.is_i64() || n.is_u64() => Some(ColumnType::Integer),
        Value::Number(_) => Some(ColumnType::Float),
        Value::String(_) => Some(ColumnType::Text),
        _ => Some(ColumnType::Json),
    }
}

/// Widen two observed kinds to one that holds both.
fn widen(current: Option<ColumnType>, seen: ColumnType) -> ColumnType {
    match (current, seen) {
        (None, seen) => seen,
        (Some(a), b) if a == b => a,
        (Some(ColumnType::Integer), ColumnType::Float)
        | (Some(ColumnType::Float), ColumnType::Integer) => ColumnType::Float,
        _ => ColumnType::Text,
    }
}

/// Infer column types from the first rows of string data.
#[inline]
pub fn infer_columns(headers: &[String], rows: &[Vec<String>]) -> Result<Vec<ColumnSpec>> {
    let mut kinds: Vec<Option<ColumnType>> = vec![None; headers.len()];
    for row in rows.iter().take(INFERENCE_SAMPLE) {
        for (slot, raw) in kinds.iter_mut().zip(row) {
            if let Some(seen) = text_kind(raw) {
                *slot = Some(widen(*slot, seen));
            }
        }
    }
    column_specs(headers, kinds)
}

/// Infer column names (first-seen key order) and types from JSON objects.
#[inline]
pub fn infer_json_columns(records: &[Map<String, Value>]) -> Result<Vec<ColumnSpec>> {
    let mut headers: Vec<String> = Vec::new();
    let mut kinds: Vec<Option<ColumnType>> = Vec::new();
    for (n, record) in records.iter().enumerate() {
        for (key, value) in record {
            let idx = match headers.iter().position(|h| h == key) {
                Some(idx) => idx,
                None => {
                    headers.push(key.clone());
                    kinds.push(None);
                    headers.len() - 1
                }
            };
            if n < INFERENCE_SAMPLE {
                if let Some(seen) = json_kind(value) {
                    kinds[idx] = Some(widen(kinds[idx], seen));
                }
            }
        }
    }
    column_specs(&headers, kinds)
}

fn column_specs(headers: &[String], kinds: Vec<Option<ColumnType>>) -> Result<Vec<ColumnSpec>> {
    let mut seen = HashSet::new();
    headers
        .iter()
        .zip(kinds)
        .map(|(header, kind)| -> Result<ColumnSpec> {
            let name = safe_name(header)?;
            if !seen.insert(name.clone()) {
                return Err(IndexError::InvalidName(format!(
                    "Duplicate column {} after normalization",
                    name
                )));
            }
            Ok(ColumnSpec {
                name,
                kind: kind.unwrap_or(ColumnType::Text),
            })
        })
        .collect()
}

/// A relational table living next to a library's block collection.
#[derive(Clone)]
pub struct CustomTable {
    index: Arc<dyn TextIndex>,
    name: String,
    columns: Vec<ColumnSpec>,
}

impl std::fmt::Debug for CustomTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomTable")
            .field("name", &self.name)
            .field("columns", &self.columns)
            .finish_non_exhaustive()
    }
}

impl CustomTable {
    /// Describe a table. Nothing is created until [`CustomTable::create`].
    pub fn new(index: Arc<dyn TextIndex>, name: &str, columns: Vec<ColumnSpec>) -> Result<Self> {
        if !index.backend().is_relational() {
            return Err(index.custom_tables_unsupported(name));
        }

        let name = safe_name(name)?;
        if name == index.collection_name() {
            return Err(IndexError::InvalidName(format!(
                "{} is the block collection of this library",
                name
            )));
        }
        if columns.is_empty() {
            return Err(IndexError::Config(format!("Table {} has no columns", name)));
        }

        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        let kinds = columns.iter().map(|c| Some(c.kind)).collect();
        let columns = column_specs(&names, kinds)?;

        Ok(Self {
            index,
            name,
            columns,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub async fn create(&self) -> Result<()> {
        debug!("Creating custom table {}", self.name);
        self.index.create_table(&self.name, &self.columns).await
    }

    /// Create a table from a CSV file with a header row and load every row.
    pub async fn load_csv(index: Arc<dyn TextIndex>, name: &str, path: &Path) -> Result<(Self, u64)> {
        let mut reader = csv::Reader::from_path(path).map_err(|e| {
            IndexError::Config(format!("Failed to read CSV {}: {}", path.display(), e))
        })?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| IndexError::Config(format!("Failed to read CSV header: {}", e)))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut raw_rows = Vec::new();
        for record in reader.records() {
            let record =
                record.map_err(|e| IndexError::Config(format!("Failed to read CSV row: {}", e)))?;
            raw_rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
        }

        let table = Self::new(index, name, infer_columns(&headers, &raw_rows)?)?;
        let rows = raw_rows
            .iter()
            .map(|raw| {
                table
                    .columns
                    .iter()
                    .enumerate()
                    .map(|(idx, column)| {
                        Cell::parse(raw.get(idx).map_or("", String::as_str), column.kind)
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        table.create().await?;
        let inserted = table.insert_rows(rows).await?;
        info!("Loaded {} rows from {} into {}", inserted, path.display(), table.name);
        Ok((table, inserted))
    }

    /// Create a table from a JSON array of objects or a JSON-lines file.
    pub async fn load_json(index: Arc<dyn TextIndex>, name: &str, path: &Path) -> Result<(Self, u64)> {
        let content = std::fs::read_to_string(path)?;
        let records = parse_json_records(&content)?;

        let table = Self::new(index, name, infer_json_columns(&records)?)?;
        let rows = records
            .iter()
            .map(|record| {
                let normalized: Map<String, Value> = record
                    .iter()
                    .filter_map(|(k, v)| safe_name(k).ok().map(|k| (k, v.clone())))
                    .collect();
                table
                    .columns
                    .iter()
                    .map(|column| {
                        normalized
                            .get(&column.name)
                            .map_or(Ok(Cell::Null), |v| Cell::from_json(v).coerce(column.kind))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        table.create().await?;
        let inserted = table.insert_rows(rows).await?;
        info!("Loaded {} records from {} into {}", inserted, path.display(), table.name);
        Ok((table, inserted))
    }

    /// Insert rows given in column order. Cells are coerced to the column types.
    pub async fn insert_rows(&self, rows: Vec<Vec<Cell>>) -> Result<u64> {
        let rows = rows
            .into_iter()
            .map(|row| {
                if row.len() != self.columns.len() {
                    return Err(IndexError::Config(format!(
                        "Row has {} values, table {} has {} columns",
                        row.len(),
                        self.name,
                        self.columns.len()
                    )));
                }
                row.into_iter()
                    .zip(&self.columns)
                    .map(|(cell, column)| cell.coerce(column.kind))
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        if rows.is_empty() {
            return Ok(0);
        }
        self.index.insert_rows(&self.name, &self.columns, &rows).await
    }

    /// Rows whose `column` equals `value`.
    pub async fn lookup(&self, column: &str, value: Cell) -> Result<Vec<Map<String, Value>>> {
        let column = safe_name(column)?;
        let spec = self
            .columns
            .iter()
            .find(|c| c.name == column)
            .ok_or_else(|| {
                IndexError::Config(format!("Table {} has no column {}", self.name, column))
            })?;
        let value = value.coerce(spec.kind)?;
        self.index
            .query_table(&self.name, &self.columns, Some((&spec.name, &value)))
            .await
    }

    pub async fn rows(&self) -> Result<Vec<Map<String, Value>>> {
        self.index.query_table(&self.name, &self.columns, None).await
    }

    pub async fn drop(&self) -> Result<()> {
        info!("Dropping custom table {}", self.name);
        self.index.drop_table(&self.name).await
    }
}

fn parse_json_records(content: &str) -> Result<Vec<Map<String, Value>>> {
    let trimmed = content.trim_start();
    let values: Vec<Value> = if trimmed.starts_with('[') {
        serde_json::from_str(trimmed)?
    } else {
        trimmed
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(serde_json::from_str::<Value>)
            .collect::<std::result::Result<_, _>>()?
    };

    values
        .into_iter()
        .map(|value| match value {
            Value::Object(map) => Ok(map),
            other => Err(IndexError::Config(format!(
                "Expected a JSON object per record, got {}",
                other
            ))),
        })
        .collect()
}
