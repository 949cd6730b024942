
use async_stream::try_stream;
use async_trait::async_trait;
use futures::TryStreamExt;
use itertools::Itertools;
use serde_json::{Map, Value};
use sqlx::query::Query;
use sqlx::sqlite::{
    SqliteArguments, SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Connection, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::analyzer;
use super::cursor::Cursor;
use super::model::{Block, EmbeddingRecord, FieldValue, Filter, LibraryCard};
use super::schema::{
    self, BLOCK_FIELDS, Dialect, FLAGS_FIELD, FieldKind, KEY_FIELD, LIBRARY_CARDS_TABLE,
    quote_ident,
};
use super::TextIndex;
use crate::config::TextIndexBackend;
use crate::custom_table::{Cell, ColumnSpec, ColumnType};
use crate::{IndexError, Result};

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

const TERMS_COLUMN: &str = "terms";

/// Embedded relational backend: one table per library plus an FTS5 table holding the
/// analyzed `text_search` of each row under the same rowid.
#[derive(Debug, Clone)]
pub struct SqliteTextIndex {
    pool: SqlitePool,
    options: SqliteConnectOptions,
    account_name: String,
    collection: String,
    close_cursor_on_exhaustion: bool,
}

impl SqliteTextIndex {
    pub async fn open(
        path: &Path,
        account_name: &str,
        collection: &str,
        close_cursor_on_exhaustion: bool,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        // WAL lets a job cursor keep reading while flags are written through the pool
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options.clone())
            .await
            .map_err(|e| {
                IndexError::TextIndex(format!(
                    "Failed to open SQLite text index {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let index = Self {
            pool,
            options,
            account_name: account_name.to_string(),
            collection: collection.to_string(),
            close_cursor_on_exhaustion,
        };
        index.create_library_cards_table().await?;

        debug!("Opened SQLite text index at {}", path.display());
        Ok(index)
    }

    #[inline]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    fn table(&self) -> String {
        quote_ident(&self.collection)
    }

    fn fts_table_name(&self) -> String {
        format!("{}_fts", self.collection)
    }

    async fn create_library_cards_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                account_name TEXT NOT NULL,
                library_name TEXT NOT NULL,
                documents INTEGER NOT NULL DEFAULT 0,
                blocks INTEGER NOT NULL DEFAULT 0,
                images INTEGER NOT NULL DEFAULT 0,
                pages INTEGER NOT NULL DEFAULT 0,
                \"tables\" INTEGER NOT NULL DEFAULT 0,
                unique_doc_id INTEGER NOT NULL DEFAULT 0,
                embedding TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (account_name, library_name)
            )",
            LIBRARY_CARDS_TABLE
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    fn create_table_sql(&self) -> String {
        let columns = BLOCK_FIELDS
            .iter()
            .map(|spec| {
                let column_type = match spec.kind {
                    FieldKind::Key => "INTEGER PRIMARY KEY AUTOINCREMENT",
                    FieldKind::Integer => "INTEGER NOT NULL DEFAULT 0",
                    FieldKind::Text => "TEXT NOT NULL DEFAULT ''",
                    FieldKind::Flags => "TEXT NOT NULL DEFAULT '{}'",
                };
                format!("{} {}", quote_ident(spec.name), column_type)
            })
            .join(", ");
        format!("CREATE TABLE IF NOT EXISTS {} ({})", self.table(), columns)
    }

    fn select_sql(&self, condition: &str) -> String {
        format!(
            "SELECT {} FROM {}{} ORDER BY {}",
            schema::column_list(),
            self.table(),
            condition,
            quote_ident(KEY_FIELD)
        )
    }

    /// Stream rows over a dedicated connection that the cursor owns.
    fn stream_blocks(&self, sql: String, binds: Vec<FieldValue>) -> Cursor {
        let options = self.options.clone();
        let rows = try_stream! {
            let mut conn = SqliteConnection::connect_with(&options)
                .await
                .map_err(IndexError::from)?;
            {
                let mut rows = bind_values(sqlx::query(&sql), &binds).fetch(&mut conn);
                while let Some(row) = rows.try_next().await.map_err(IndexError::from)? {
                    yield decode_row(&row)?;
                }
            }
            conn.close().await.map_err(IndexError::from)?;
        };
        Cursor::new(Box::pin(rows), self.close_cursor_on_exhaustion)
    }

    /// Replace the analyzed search terms stored for `rowid`.
    async fn index_terms(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        rowid: i64,
        text: &str,
    ) -> Result<()> {
        let fts = quote_ident(&self.fts_table_name());
        sqlx::query(&format!("DELETE FROM {} WHERE rowid = ?", fts))
            .bind(rowid)
            .execute(&mut **tx)
            .await?;
        sqlx::query(&format!(
            "INSERT INTO {} (rowid, {}) VALUES (?, ?)",
            fts, TERMS_COLUMN
        ))
        .bind(rowid)
        .bind(analyzer::indexed_text(text))
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn count_where(&self, condition: &str, binds: &[FieldValue]) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}{}", self.table(), condition);
        let row = bind_values(sqlx::query(&sql), binds)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn json_path(flag_key: &str) -> String {
    format!("$.\"{}\"", flag_key.replace('"', "\\\""))
}

fn flags_column() -> String {
    quote_ident(FLAGS_FIELD)
}

fn bind_values<'q>(mut query: SqliteQuery<'q>, binds: &[FieldValue]) -> SqliteQuery<'q> {
    for value in binds {
        query = match value {
            FieldValue::Int(i) => query.bind(*i),
            FieldValue::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

fn bind_token<'q>(query: SqliteQuery<'q>, token: &Value) -> SqliteQuery<'q> {
    match token {
        Value::Number(n) if n.is_i64() => query.bind(n.as_i64().unwrap_or_default()),
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

fn bind_cell<'q>(query: SqliteQuery<'q>, cell: &Cell) -> SqliteQuery<'q> {
    match cell {
        Cell::Null => query.bind(Option::<String>::None),
        Cell::Int(i) => query.bind(*i),
        Cell::Float(f) => query.bind(*f),
        Cell::Text(s) => query.bind(s.clone()),
        Cell::Json(v) => query.bind(v.to_string()),
    }
}

fn decode_row(row: &SqliteRow) -> Result<Block> {
    schema::decode_block(|idx, spec| {
        Ok(match spec.kind {
            FieldKind::Key => Value::from(row.try_get::<i64, _>(idx)?.to_string()),
            FieldKind::Integer => row
                .try_get::<Option<i64>, _>(idx)?
                .map_or(Value::Null, Value::from),
            FieldKind::Text => row
                .try_get::<Option<String>, _>(idx)?
                .map_or(Value::Null, Value::from),
            FieldKind::Flags => match row.try_get::<Option<String>, _>(idx)? {
                Some(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw)?,
                _ => Value::Object(Map::new()),
            },
        })
    })
}

fn decode_card(row: &SqliteRow) -> Result<LibraryCard> {
    let count = |name: &str| -> Result<u64> {
        let value: i64 = row.try_get(name)?;
        Ok(u64::try_from(value).unwrap_or_default())
    };
    let embedding: String = row.try_get("embedding")?;
    Ok(LibraryCard {
        library_name: row.try_get("library_name")?,
        account_name: row.try_get("account_name")?,
        documents: count("documents")?,
        blocks: count("blocks")?,
        images: count("images")?,
        pages: count("pages")?,
        tables: count("tables")?,
        unique_doc_id: row.try_get("unique_doc_id")?,
        embedding: serde_json::from_str(&embedding)?,
    })
}

#[async_trait]
impl TextIndex for SqliteTextIndex {
    fn backend(&self) -> TextIndexBackend {
        TextIndexBackend::Sqlite
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }

    fn account_name(&self) -> &str {
        &self.account_name
    }

    async fn check_if_table_build_required(&self) -> Result<bool> {
        let row = sqlx::query("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(&self.collection)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count == 0)
    }

    async fn build_text_index(&self) -> Result<()> {
        info!("Building SQLite text index {}", self.collection);

        let table = self.table();
        let fts = quote_ident(&self.fts_table_name());
        let key = quote_ident(KEY_FIELD);
        let trigger = |suffix: &str| quote_ident(&format!("{}_{}", self.collection, suffix));

        let statements = [
            self.create_table_sql(),
            format!(
                "CREATE VIRTUAL TABLE IF NOT EXISTS {fts} USING fts5({terms}, tokenize='unicode61 remove_diacritics 0')",
                fts = fts,
                terms = TERMS_COLUMN
            ),
            format!(
                "CREATE TRIGGER IF NOT EXISTS {ad} AFTER DELETE ON {table} BEGIN \
                 DELETE FROM {fts} WHERE rowid = old.{key}; END",
                ad = trigger("ad"),
                table = table,
                fts = fts,
                key = key
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                trigger("doc_idx"),
                table,
                quote_ident("doc_ID")
            ),
        ];

        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await.map_err(|e| {
                IndexError::TextIndex(format!(
                    "Failed to build text index {}: {}",
                    self.collection, e
                ))
            })?;
        }

        debug!("SQLite text index {} ready", self.collection);
        Ok(())
    }

    async fn delete_collection(&self) -> Result<()> {
        info!("Deleting SQLite collection {}", self.collection);
        sqlx::query(&format!(
            "DROP TABLE IF EXISTS {}",
            quote_ident(&self.fts_table_name())
        ))
        .execute(&self.pool)
        .await?;
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table()))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE account_name = ? AND library_name = ?",
            LIBRARY_CARDS_TABLE
        ))
        .bind(&self.account_name)
        .bind(&self.collection)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, filters: &[Filter]) -> Result<Vec<Block>> {
        let rendered = schema::render_where(filters, Dialect::Sqlite, &mut 1)?;
        let sql = self.select_sql(&rendered.where_sql());
        let rows = bind_values(sqlx::query(&sql), &rendered.binds)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn text_search(&self, text: &str, filters: &[Filter]) -> Result<Vec<Block>> {
        let terms = analyzer::query_terms(text);
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let match_expr = terms.iter().map(|t| format!("\"{}\"", t)).join(" ");
        let rendered = schema::render_where(filters, Dialect::Sqlite, &mut 1)?;
        let fts = quote_ident(&self.fts_table_name());

        let sql = format!(
            "SELECT {columns} FROM {table} \
             JOIN (SELECT rowid AS fts_rowid, bm25({fts}) AS fts_score FROM {fts} WHERE {fts} MATCH ?) AS ranked \
             ON {table}.{key} = ranked.fts_rowid{filters} \
             ORDER BY ranked.fts_score ASC, {table}.{key} ASC",
            columns = BLOCK_FIELDS
                .iter()
                .map(|spec| format!("{}.{}", self.table(), quote_ident(spec.name)))
                .join(", "),
            table = self.table(),
            fts = fts,
            key = quote_ident(KEY_FIELD),
            filters = rendered.where_sql(),
        );

        let rows = bind_values(sqlx::query(&sql).bind(match_expr), &rendered.binds)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn get_whole_collection(&self) -> Result<Cursor> {
        Ok(self.stream_blocks(self.select_sql(""), Vec::new()))
    }

    async fn count_documents(&self, filters: &[Filter]) -> Result<u64> {
        let rendered = schema::render_where(filters, Dialect::Sqlite, &mut 1)?;
        self.count_where(&rendered.where_sql(), &rendered.binds)
            .await
    }

    async fn embedding_job_cursor(
        &self,
        flag_key: &str,
        doc_ids: Option<&[i64]>,
    ) -> Result<(u64, Cursor)> {
        let (condition, binds) = match doc_ids {
            Some(ids) => {
                let values = ids.iter().copied().map(FieldValue::Int).collect();
                let rendered = schema::render_where(
                    &[Filter::one_of("doc_ID", values)],
                    Dialect::Sqlite,
                    &mut 1,
                )?;
                (rendered.where_sql(), rendered.binds)
            }
            None => (
                format!(" WHERE json_extract({}, ?) IS NULL", flags_column()),
                vec![FieldValue::Text(json_path(flag_key))],
            ),
        };

        let count = self.count_where(&condition, &binds).await?;
        debug!(
            "Embedding job on {} for {}: {} blocks",
            self.collection, flag_key, count
        );
        Ok((count, self.stream_blocks(self.select_sql(&condition), binds)))
    }

    async fn count_embedded_blocks(&self, flag_key: &str) -> Result<u64> {
        self.count_where(
            &format!(" WHERE json_extract({}, ?) IS NOT NULL", flags_column()),
            &[FieldValue::Text(json_path(flag_key))],
        )
        .await
    }

    async fn get_distinct_list(&self, key: &str) -> Result<Vec<FieldValue>> {
        let spec = schema::filterable_field(key)?;
        let column = quote_ident(spec.name);
        let sql = format!(
            "SELECT DISTINCT {column} FROM {} WHERE {column} IS NOT NULL ORDER BY {column}",
            self.table(),
            column = column
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> Result<FieldValue> {
                Ok(match spec.kind {
                    FieldKind::Key => FieldValue::Text(row.try_get::<i64, _>(0)?.to_string()),
                    FieldKind::Integer => FieldValue::Int(row.try_get(0)?),
                    _ => FieldValue::Text(row.try_get(0)?),
                })
            })
            .collect()
    }

    async fn insert_block(&self, block: &Block) -> Result<String> {
        let fields: Vec<_> = schema::insert_fields().collect();
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            self.table(),
            fields.iter().map(|spec| quote_ident(spec.name)).join(", "),
            fields.iter().map(|_| "?").join(", ")
        );

        let mut query = sqlx::query(&sql);
        for spec in &fields {
            query = match spec.kind {
                FieldKind::Integer => query.bind(block.get_i64(spec.name).unwrap_or_default()),
                FieldKind::Flags => query.bind(
                    block
                        .get(spec.name)
                        .filter(|v| v.is_object())
                        .map_or_else(|| "{}".to_string(), Value::to_string),
                ),
                FieldKind::Key | FieldKind::Text => {
                    query.bind(block.get_str(spec.name).unwrap_or_default().to_string())
                }
            };
        }

        let mut tx = self.pool.begin().await?;
        let rowid = query.execute(&mut *tx).await?.last_insert_rowid();
        self.index_terms(
            &mut tx,
            rowid,
            block.get_str(schema::SEARCH_FIELD).unwrap_or_default(),
        )
        .await?;
        tx.commit().await?;
        Ok(rowid.to_string())
    }

    async fn update_one_record(
        &self,
        filters: &[Filter],
        key: &str,
        value: &Value,
    ) -> Result<u64> {
        let spec = schema::filterable_field(key)?;
        let rendered = schema::render_where(filters, Dialect::Sqlite, &mut 1)?;
        let target_sql = format!(
            "SELECT {key} FROM {table}{filters} ORDER BY {key} LIMIT 1",
            table = self.table(),
            key = quote_ident(KEY_FIELD),
            filters = rendered.where_sql()
        );
        let update_sql = format!(
            "UPDATE {} SET {} = ? WHERE {} = ?",
            self.table(),
            quote_ident(spec.name),
            quote_ident(KEY_FIELD)
        );

        let mut tx = self.pool.begin().await?;
        let Some(row) = bind_values(sqlx::query(&target_sql), &rendered.binds)
            .fetch_optional(&mut *tx)
            .await?
        else {
            return Ok(0);
        };
        let rowid: i64 = row.try_get(0)?;

        let text = value
            .as_str()
            .map_or_else(|| value.to_string(), str::to_string);
        let query = match spec.kind {
            FieldKind::Integer => {
                let number = FieldValue::from_json(value)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        IndexError::Config(format!("Field {} expects an integer", spec.name))
                    })?;
                sqlx::query(&update_sql).bind(number)
            }
            _ => sqlx::query(&update_sql).bind(text.clone()),
        };
        let changed = query.bind(rowid).execute(&mut *tx).await?.rows_affected();

        if spec.name == schema::SEARCH_FIELD {
            self.index_terms(&mut tx, rowid, &text).await?;
        }
        tx.commit().await?;
        Ok(changed)
    }

    async fn delete_record_by_key(&self, key: &str, value: &FieldValue) -> Result<u64> {
        let rendered = schema::render_where(
            &[Filter::Equals {
                key: key.to_string(),
                value: value.clone(),
            }],
            Dialect::Sqlite,
            &mut 1,
        )?;
        let sql = format!("DELETE FROM {}{}", self.table(), rendered.where_sql());
        let result = bind_values(sqlx::query(&sql), &rendered.binds)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn add_new_embedding_flag(
        &self,
        id: &str,
        flag_key: &str,
        token: &Value,
    ) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET {flags} = json_set({flags}, ?, json(?)) WHERE {key} = ?",
            table = self.table(),
            flags = flags_column(),
            key = quote_ident(KEY_FIELD)
        );
        let result = sqlx::query(&sql)
            .bind(json_path(flag_key))
            .bind(token.to_string())
            .bind(schema::parse_row_id(id)?)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(IndexError::TextIndex(format!(
                "No block {} in {}",
                id, self.collection
            )));
        }
        Ok(())
    }

    async fn add_embedding_flags(&self, flag_key: &str, flags: &[(String, Value)]) -> Result<()> {
        let sql = format!(
            "UPDATE {table} SET {flags} = json_set({flags}, ?, json(?)) WHERE {key} = ?",
            table = self.table(),
            flags = flags_column(),
            key = quote_ident(KEY_FIELD)
        );
        let path = json_path(flag_key);

        let mut tx = self.pool.begin().await?;
        for (id, token) in flags {
            let result = sqlx::query(&sql)
                .bind(&path)
                .bind(token.to_string())
                .bind(schema::parse_row_id(id)?)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() == 0 {
                return Err(IndexError::TextIndex(format!(
                    "No block {} in {}",
                    id, self.collection
                )));
            }
        }
        tx.commit().await?;
        Ok(())
    }

    async fn unset_embedding_flag(&self, flag_key: &str) -> Result<u64> {
        let sql = format!(
            "UPDATE {table} SET {flags} = json_remove({flags}, ?) WHERE json_extract({flags}, ?) IS NOT NULL",
            table = self.table(),
            flags = flags_column()
        );
        let path = json_path(flag_key);
        let result = sqlx::query(&sql)
            .bind(path.clone())
            .bind(path)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn lookup_embedding_flag(
        &self,
        flag_key: &str,
        token: &Value,
    ) -> Result<Option<Block>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE json_extract({}, ?) = ? LIMIT 1",
            schema::column_list(),
            self.table(),
            flags_column()
        );
        let query = sqlx::query(&sql).bind(json_path(flag_key));
        let row = bind_token(query, token).fetch_optional(&self.pool).await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn get_library_card(&self) -> Result<Option<LibraryCard>> {
        let sql = format!(
            "SELECT * FROM {} WHERE account_name = ? AND library_name = ?",
            LIBRARY_CARDS_TABLE
        );
        let row = sqlx::query(&sql)
            .bind(&self.account_name)
            .bind(&self.collection)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_card).transpose()
    }

    async fn save_library_card(&self, card: &LibraryCard) -> Result<()> {
        let sql = format!(
            "INSERT INTO {table} (account_name, library_name, documents, blocks, images, pages, \"tables\", unique_doc_id, embedding)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(account_name, library_name) DO UPDATE SET
                documents = excluded.documents,
                blocks = excluded.blocks,
                images = excluded.images,
                pages = excluded.pages,
                \"tables\" = excluded.\"tables\",
                unique_doc_id = MAX({table}.unique_doc_id, excluded.unique_doc_id),
                embedding = excluded.embedding",
            table = LIBRARY_CARDS_TABLE
        );
        let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);

        sqlx::query(&sql)
            .bind(&self.account_name)
            .bind(&self.collection)
            .bind(as_i64(card.documents))
            .bind(as_i64(card.blocks))
            .bind(as_i64(card.images))
            .bind(as_i64(card.pages))
            .bind(as_i64(card.tables))
            .bind(card.unique_doc_id)
            .bind(serde_json::to_string(&card.embedding)?)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn merge_embedding_record(
        &self,
        record: EmbeddingRecord,
        delete: bool,
    ) -> Result<LibraryCard> {
        let mut tx = self.pool.begin().await?;
        // Writing first takes the database write lock before the card is read.
        let claim = format!(
            "UPDATE {} SET embedding = embedding WHERE account_name = ? AND library_name = ?",
            LIBRARY_CARDS_TABLE
        );
        sqlx::query(&claim)
            .bind(&self.account_name)
            .bind(&self.collection)
            .execute(&mut *tx)
            .await?;

        let select = format!(
            "SELECT * FROM {} WHERE account_name = ? AND library_name = ?",
            LIBRARY_CARDS_TABLE
        );
        let row = sqlx::query(&select)
            .bind(&self.account_name)
            .bind(&self.collection)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| {
                IndexError::TextIndex(format!("No library card for {}", self.collection))
            })?;
        let mut card = decode_card(&row)?;
        card.merge_embedding_record(record, delete);

        let update = format!(
            "UPDATE {} SET embedding = ? WHERE account_name = ? AND library_name = ?",
            LIBRARY_CARDS_TABLE
        );
        sqlx::query(&update)
            .bind(serde_json::to_string(&card.embedding)?)
            .bind(&self.account_name)
            .bind(&self.collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(card)
    }

    async fn update_card_counts(&self, card: &LibraryCard) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET documents = ?, blocks = ?, images = ?, pages = ?, \"tables\" = ? \
             WHERE account_name = ? AND library_name = ?",
            LIBRARY_CARDS_TABLE
        );
        let as_i64 = |v: u64| i64::try_from(v).unwrap_or(i64::MAX);
        let result = sqlx::query(&sql)
            .bind(as_i64(card.documents))
            .bind(as_i64(card.blocks))
            .bind(as_i64(card.images))
            .bind(as_i64(card.pages))
            .bind(as_i64(card.tables))
            .bind(&self.account_name)
            .bind(&self.collection)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(IndexError::TextIndex(format!(
                "No library card for {}",
                self.collection
            )));
        }
        Ok(())
    }

    async fn get_and_increment_doc_id(&self) -> Result<i64> {
        let sql = format!(
            "UPDATE {} SET unique_doc_id = unique_doc_id + 1 WHERE account_name = ? AND library_name = ? RETURNING unique_doc_id",
            LIBRARY_CARDS_TABLE
        );
        let row = sqlx::query(&sql)
            .bind(&self.account_name)
            .bind(&self.collection)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| {
                IndexError::TextIndex(format!("No library card for {}", self.collection))
            })?;
        Ok(row.try_get(0)?)
    }

    async fn create_table(&self, name: &str, columns: &[ColumnSpec]) -> Result<()> {
        let columns = columns
            .iter()
            .map(|column| {
                let column_type = match column.kind {
                    ColumnType::Integer => "INTEGER",
                    ColumnType::Float => "REAL",
                    ColumnType::Text | ColumnType::Json => "TEXT",
                };
                format!("{} {}", quote_ident(&column.name), column_type)
            })
            .join(", ");
        let sql = format!("CREATE TABLE IF NOT EXISTS {} ({})", quote_ident(name), columns);
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_rows(
        &self,
        name: &str,
        columns: &[ColumnSpec],
        rows: &[Vec<Cell>],
    ) -> Result<u64> {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(name),
            columns.iter().map(|c| quote_ident(&c.name)).join(", "),
            columns.iter().map(|_| "?").join(", ")
        );

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let mut query = sqlx::query(&sql);
            for cell in row {
                query = bind_cell(query, cell);
            }
            query.execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(rows.len() as u64)
    }

    async fn query_table(
        &self,
        name: &str,
        columns: &[ColumnSpec],
        filter: Option<(&str, &Cell)>,
    ) -> Result<Vec<Map<String, Value>>> {
        let condition = filter.map_or_else(String::new, |(column, _)| {
            format!(" WHERE {} = ?", quote_ident(column))
        });
        let sql = format!(
            "SELECT {} FROM {}{} ORDER BY rowid",
            columns.iter().map(|c| quote_ident(&c.name)).join(", "),
            quote_ident(name),
            condition
        );

        let mut query = sqlx::query(&sql);
        if let Some((_, cell)) = filter {
            query = bind_cell(query, cell);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.iter()
            .map(|row| -> Result<Map<String, Value>> {
                let mut map = Map::with_capacity(columns.len());
                for (idx, column) in columns.iter().enumerate() {
                    let value = match column.kind {
                        ColumnType::Integer => row
                            .try_get::<Option<i64>, _>(idx)?
                            .map_or(Value::Null, Value::from),
                        ColumnType::Float => row
                            .try_get::<Option<f64>, _>(idx)?
                            .map_or(Value::Null, Value::from),
                        ColumnType::Text => row
                            .try_get::<Option<String>, _>(idx)?
                            .map_or(Value::Null, Value::from),
                        ColumnType::Json => match row.try_get::<Option<String>, _>(idx)? {
                            Some(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
                            None => Value::Null,
                        },
                    };
                    map.insert(column.name.clone(), value);
                }
                Ok(map)
            })
            .collect()
    }

    async fn drop_table(&self, name: &str) -> Result<()> {
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", quote_ident(name)))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
