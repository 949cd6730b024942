
use async_stream::try_stream;
use async_trait::async_trait;
use futures::TryStreamExt;
use itertools::Itertools;
use serde_json::{Map, Value};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{Connection, PgConnection, PgPool, Postgres, Row};
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

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// Analyzed copy of `text_search`; the `ts` vector is generated from it.
const TERMS_COLUMN: &str = "search_terms";

/// Server-backed relational backend. Keyword search runs on a generated `tsvector`
/// over pre-analyzed terms, so stemming matches the other backends.
#[derive(Debug, Clone)]
pub struct PostgresTextIndex {
    pool: PgPool,
    url: String,
    account_name: String,
    collection: String,
    close_cursor_on_exhaustion: bool,
}

impl PostgresTextIndex {
    pub async fn connect(
        url: &str,
        account_name: &str,
        collection: &str,
        close_cursor_on_exhaustion: bool,
    ) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(|e| {
                IndexError::TextIndex(format!("Failed to connect to Postgres text index: {}", e))
            })?;

        let index = Self {
            pool,
            url: url.to_string(),
            account_name: account_name.to_string(),
            collection: collection.to_string(),
            close_cursor_on_exhaustion,
        };
        index.create_library_cards_table().await?;

        debug!("Connected Postgres text index for {}", collection);
        Ok(index)
    }

    #[inline]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn table(&self) -> String {
        quote_ident(&self.collection)
    }

    async fn create_library_cards_table(&self) -> Result<()> {
        let sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                account_name TEXT NOT NULL,
                library_name TEXT NOT NULL,
                documents BIGINT NOT NULL DEFAULT 0,
                blocks BIGINT NOT NULL DEFAULT 0,
                images BIGINT NOT NULL DEFAULT 0,
                pages BIGINT NOT NULL DEFAULT 0,
                \"tables\" BIGINT NOT NULL DEFAULT 0,
                unique_doc_id BIGINT NOT NULL DEFAULT 0,
                embedding JSONB NOT NULL DEFAULT '[]'::jsonb,
                PRIMARY KEY (account_name, library_name)
            )",
            LIBRARY_CARDS_TABLE
        );
        sqlx::query(&sql).execute(&self.pool).await?;
        Ok(())
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

    fn stream_blocks(&self, sql: String, binds: Vec<FieldValue>) -> Cursor {
        let url = self.url.clone();
        let rows = try_stream! {
            let mut conn = PgConnection::connect(&url).await.map_err(IndexError::from)?;
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

    async fn count_where(&self, condition: &str, binds: &[FieldValue]) -> Result<u64> {
        let sql = format!("SELECT COUNT(*) FROM {}{}", self.table(), condition);
        let row = bind_values(sqlx::query(&sql), binds)
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get(0)?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

fn flags_column() -> String {
    quote_ident(FLAGS_FIELD)
}

fn bind_values<'q>(mut query: PgQuery<'q>, binds: &[FieldValue]) -> PgQuery<'q> {
    for value in binds {
        query = match value {
            FieldValue::Int(i) => query.bind(*i),
            FieldValue::Text(s) => query.bind(s.clone()),
        };
    }
    query
}

/// NULLs are bound with the column's own type so Postgres accepts them.
fn bind_cell<'q>(query: PgQuery<'q>, cell: &Cell, kind: ColumnType) -> PgQuery<'q> {
    match (cell, kind) {
        (Cell::Null, ColumnType::Integer) => query.bind(Option::<i64>::None),
        (Cell::Null, ColumnType::Float) => query.bind(Option::<f64>::None),
        (Cell::Null, ColumnType::Text) => query.bind(Option::<String>::None),
        (Cell::Null, ColumnType::Json) => query.bind(Option::<Value>::None),
        (Cell::Int(i), _) => query.bind(*i),
        (Cell::Float(f), _) => query.bind(*f),
        (Cell::Text(s), _) => query.bind(s.clone()),
        (Cell::Json(v), _) => query.bind(v.clone()),
    }
}

fn decode_row(row: &PgRow) -> Result<Block> {
    schema::decode_block(|idx, spec| {
        Ok(match spec.kind {
            FieldKind::Key => Value::from(row.try_get::<i64, _>(idx)?.to_string()),
            FieldKind::Integer => row
                .try_get::<Option<i64>, _>(idx)?
                .map_or(Value::Null, Value::from),
            FieldKind::Text => row
                .try_get::<Option<String>, _>(idx)?
                .map_or(Value::Null, Value::from),
            FieldKind::Flags => row
                .try_get::<Option<Value>, _>(idx)?
                .unwrap_or_else(|| Value::Object(Map::new())),
        })
    })
}

fn decode_card(row: &PgRow) -> Result<LibraryCard> {
    let count = |name: &str| -> Result<u64> {
        let value: i64 = row.try_get(name)?;
        Ok(u64::try_from(value).unwrap_or_default())
    };
    let embedding: Value = row.try_get("embedding")?;
    Ok(LibraryCard {
        library_name: row.try_get("library_name")?,
        account_name: row.try_get("account_name")?,
        documents: count("documents")?,
        blocks: count("blocks")?,
        images: count("images")?,
        pages: count("pages")?,
        tables: count("tables")?,
        unique_doc_id: row.try_get("unique_doc_id")?,
        embedding: serde_json::from_value(embedding)?,
    })
}

#[async_trait]
impl TextIndex for PostgresTextIndex {
    fn backend(&self) -> TextIndexBackend {
        TextIndexBackend::Postgres
    }

    fn collection_name(&self) -> &str {
        &self.collection
    }

    fn account_name(&self) -> &str {
        &self.account_name
    }

    async fn check_if_table_build_required(&self) -> Result<bool> {
        let row = sqlx::query(
            "SELECT COUNT(*) FROM information_schema.tables \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(&self.collection)
        .fetch_one(&self.pool)
        .await?;
        let count: i64 = row.try_get(0)?;
        Ok(count == 0)
    }

    async fn build_text_index(&self) -> Result<()> {
        info!("Building Postgres text index {}", self.collection);

        let columns = BLOCK_FIELDS
            .iter()
            .map(|spec| {
                let column_type = match spec.kind {
                    FieldKind::Key => "BIGSERIAL PRIMARY KEY",
                    FieldKind::Integer => "BIGINT NOT NULL DEFAULT 0",
                    FieldKind::Text => "TEXT NOT NULL DEFAULT ''",
                    FieldKind::Flags => "JSONB NOT NULL DEFAULT '{}'::jsonb",
                };
                format!("{} {}", quote_ident(spec.name), column_type)
            })
            .join(", ");

        let statements = [
            format!(
                "CREATE TABLE IF NOT EXISTS {table} ({columns}, {terms} TEXT NOT NULL DEFAULT '', \
                 ts tsvector GENERATED ALWAYS AS (to_tsvector('simple', {terms})) STORED)",
                table = self.table(),
                columns = columns,
                terms = TERMS_COLUMN
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} USING GIN (ts)",
                quote_ident(&format!("{}_ts_idx", self.collection)),
                self.table()
            ),
            format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote_ident(&format!("{}_doc_idx", self.collection)),
                self.table(),
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
        Ok(())
    }

    async fn delete_collection(&self) -> Result<()> {
        info!("Deleting Postgres collection {}", self.collection);
        sqlx::query(&format!("DROP TABLE IF EXISTS {}", self.table()))
            .execute(&self.pool)
            .await?;
        sqlx::query(&format!(
            "DELETE FROM {} WHERE account_name = $1 AND library_name = $2",
            LIBRARY_CARDS_TABLE
        ))
        .bind(&self.account_name)
        .bind(&self.collection)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find(&self, filters: &[Filter]) -> Result<Vec<Block>> {
        let rendered = schema::render_where(filters, Dialect::Postgres, &mut 1)?;
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
        let rendered = schema::render_where(filters, Dialect::Postgres, &mut 2)?;
        let sql = format!(
            "SELECT {} FROM {} WHERE ts @@ plainto_tsquery('simple', $1){} \
             ORDER BY ts_rank(ts, plainto_tsquery('simple', $1)) DESC, {} ASC",
            schema::column_list(),
            self.table(),
            rendered.and_sql(),
            quote_ident(KEY_FIELD)
        );
        let rows = bind_values(sqlx::query(&sql).bind(terms.join(" ")), &rendered.binds)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(decode_row).collect()
    }

    async fn get_whole_collection(&self) -> Result<Cursor> {
        Ok(self.stream_blocks(self.select_sql(""), Vec::new()))
    }

    async fn count_documents(&self, filters: &[Filter]) -> Result<u64> {
        let rendered = schema::render_where(filters, Dialect::Postgres, &mut 1)?;
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
                    Dialect::Postgres,
                    &mut 1,
                )?;
                (rendered.where_sql(), rendered.binds)
            }
            None => (
                format!(" WHERE NOT ({} ? $1)", flags_column()),
                vec![FieldValue::Text(flag_key.to_string())],
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
            &format!(" WHERE {} ? $1", flags_column()),
            &[FieldValue::Text(flag_key.to_string())],
        )
        .await
    }

    async fn get_distinct_list(&self, key: &str) -> Result<Vec<FieldValue>> {
        let spec = schema::filterable_field(key)?;
        let sql = format!(
            "SELECT DISTINCT {column} FROM {} ORDER BY {column}",
            self.table(),
            column = quote_ident(spec.name)
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
            "INSERT INTO {} ({}, {}) VALUES ({}) RETURNING {}",
            self.table(),
            fields.iter().map(|spec| quote_ident(spec.name)).join(", "),
            TERMS_COLUMN,
            (1..=fields.len() + 1).map(|n| format!("${}", n)).join(", "),
            quote_ident(KEY_FIELD)
        );

        let mut query = sqlx::query(&sql);
        for spec in &fields {
            query = match spec.kind {
                FieldKind::Integer => query.bind(block.get_i64(spec.name).unwrap_or_default()),
                FieldKind::Flags => query.bind(
                    block
                        .get(spec.name)
                        .filter(|v| v.is_object())
                        .cloned()
                        .unwrap_or_else(|| Value::Object(Map::new())),
                ),
                FieldKind::Key | FieldKind::Text => {
                    query.bind(block.get_str(spec.name).unwrap_or_default().to_string())
                }
            };
        }

        let terms =
            analyzer::indexed_text(block.get_str(schema::SEARCH_FIELD).unwrap_or_default());
        let row = query.bind(terms).fetch_one(&self.pool).await?;
        let id: i64 = row.try_get(0)?;
        Ok(id.to_string())
    }

    async fn update_one_record(
        &self,
        filters: &[Filter],
        key: &str,
        value: &Value,
    ) -> Result<u64> {
        let spec = schema::filterable_field(key)?;
        let reindex = spec.name == schema::SEARCH_FIELD;
        let mut placeholder = if reindex { 3 } else { 2 };
        let rendered = schema::render_where(filters, Dialect::Postgres, &mut placeholder)?;
        let terms_update = if reindex {
            format!(", {} = $2", TERMS_COLUMN)
        } else {
            String::new()
        };
        let sql = format!(
            "UPDATE {table} SET {column} = $1{terms} WHERE {key} = (SELECT {key} FROM {table}{filters} ORDER BY {key} LIMIT 1)",
            table = self.table(),
            column = quote_ident(spec.name),
            terms = terms_update,
            key = quote_ident(KEY_FIELD),
            filters = rendered.where_sql()
        );

        let query = match spec.kind {
            FieldKind::Integer => {
                let number = FieldValue::from_json(value)
                    .and_then(|v| v.as_i64())
                    .ok_or_else(|| {
                        IndexError::Config(format!("Field {} expects an integer", spec.name))
                    })?;
                sqlx::query(&sql).bind(number)
            }
            _ => {
                let text = value
                    .as_str()
                    .map_or_else(|| value.to_string(), str::to_string);
                let terms = reindex.then(|| analyzer::indexed_text(&text));
                let query = sqlx::query(&sql).bind(text);
                match terms {
                    Some(terms) => query.bind(terms),
                    None => query,
                }
            }
        };

        let result = bind_values(query, &rendered.binds)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_record_by_key(&self, key: &str, value: &FieldValue) -> Result<u64> {
        let rendered = schema::render_where(
            &[Filter::Equals {
                key: key.to_string(),
                value: value.clone(),
            }],
            Dialect::Postgres,
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
            "UPDATE {table} SET {flags} = {flags} || jsonb_build_object($1::text, $2::jsonb) WHERE {key} = $3",
            table = self.table(),
            flags = flags_column(),
            key = quote_ident(KEY_FIELD)
        );
        let result = sqlx::query(&sql)
            .bind(flag_key.to_string())
            .bind(token.clone())
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
            "UPDATE {table} SET {flags} = {flags} || jsonb_build_object($1::text, $2::jsonb) WHERE {key} = $3",
            table = self.table(),
            flags = flags_column(),
            key = quote_ident(KEY_FIELD)
        );

        let mut tx = self.pool.begin().await?;
        for (id, token) in flags {
            let result = sqlx::query(&sql)
                .bind(flag_key.to_string())
                .bind(token.clone())
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
            "UPDATE {table} SET {flags} = {flags} - $1 WHERE {flags} ? $1",
            table = self.table(),
            flags = flags_column()
        );
        let result = sqlx::query(&sql)
            .bind(flag_key.to_string())
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
            "SELECT {} FROM {} WHERE {} -> $1 = $2::jsonb LIMIT 1",
            schema::column_list(),
            self.table(),
            flags_column()
        );
        let row = sqlx::query(&sql)
            .bind(flag_key.to_string())
            .bind(token.clone())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn get_library_card(&self) -> Result<Option<LibraryCard>> {
        let sql = format!(
            "SELECT * FROM {} WHERE account_name = $1 AND library_name = $2",
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
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (account_name, library_name) DO UPDATE SET
                documents = EXCLUDED.documents,
                blocks = EXCLUDED.blocks,
                images = EXCLUDED.images,
                pages = EXCLUDED.pages,
                \"tables\" = EXCLUDED.\"tables\",
                unique_doc_id = GREATEST({table}.unique_doc_id, EXCLUDED.unique_doc_id),
                embedding = EXCLUDED.embedding",
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
            .bind(serde_json::to_value(&card.embedding)?)
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
        let select = format!(
            "SELECT * FROM {} WHERE account_name = $1 AND library_name = $2 FOR UPDATE",
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
            "UPDATE {} SET embedding = $1 WHERE account_name = $2 AND library_name = $3",
            LIBRARY_CARDS_TABLE
        );
        sqlx::query(&update)
            .bind(serde_json::to_value(&card.embedding)?)
            .bind(&self.account_name)
            .bind(&self.collection)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(card)
    }

    async fn update_card_counts(&self, card: &LibraryCard) -> Result<()> {
        let sql = format!(
            "UPDATE {} SET documents = $1, blocks = $2, images = $3, pages = $4, \"tables\" = $5 \
             WHERE account_name = $6 AND library_name = $7",
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
            "UPDATE {} SET unique_doc_id = unique_doc_id + 1 WHERE account_name = $1 AND library_name = $2 RETURNING unique_doc_id",
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
                    ColumnType::Integer => "BIGINT",
                    ColumnType::Float => "DOUBLE PRECISION",
                    ColumnType::Text => "TEXT",
                    ColumnType::Json => "JSONB",
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
            (1..=columns.len()).map(|n| format!("${}", n)).join(", ")
        );

        let mut tx = self.pool.begin().await?;
        for row in rows {
            let mut query = sqlx::query(&sql);
            for (cell, column) in row.iter().zip(columns) {
                query = bind_cell(query, cell, column.kind);
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
            format!(" WHERE {} = $1", quote_ident(column))
        });
        let sql = format!(
            "SELECT {} FROM {}{}",
            columns.iter().map(|c| quote_ident(&c.name)).join(", "),
            quote_ident(name),
            condition
        );

        let mut query = sqlx::query(&sql);
        if let Some((column, cell)) = filter {
            let kind = columns
                .iter()
                .find(|c| c.name == column)
                .map_or(ColumnType::Text, |c| c.kind);
            query = bind_cell(query, cell, kind);
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
                        ColumnType::Json => row.try_get::<Option<Value>, _>(idx)?.unwrap_or(Value::Null),
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
