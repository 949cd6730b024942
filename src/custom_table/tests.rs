use super::*;
use crate::config::{TextIndexBackend, TextIndexConfig};
use crate::text_index;
use serde_json::json;
use tempfile::TempDir;

async fn open_index(dir: &TempDir, backend: TextIndexBackend) -> Arc<dyn TextIndex> {
    let config = TextIndexConfig {
        backend,
        ..TextIndexConfig::default()
    };
    let index = text_index::open(&config, dir.path(), "acct", "contracts")
        .await
        .expect("should open index");
    index.build_text_index().await.expect("should build");
    index
}

#[test]
fn infers_column_types_from_samples() {
    let headers = vec![
        "Employee ID".to_string(),
        "rate".to_string(),
        "name".to_string(),
        "meta".to_string(),
        "blank".to_string(),
    ];
    let rows = vec![
        vec!["1".into(), "10".into(), "Ann".into(), "{\"a\":1}".into(), "".into()],
        vec!["2".into(), "12.5".into(), "Bo".into(), "[1,2]".into(), "".into()],
    ];

    let columns = infer_columns(&headers, &rows).expect("should infer");
    assert_eq!(
        columns,
        vec![
            ColumnSpec::new("employee_id", ColumnType::Integer),
            ColumnSpec::new("rate", ColumnType::Float),
            ColumnSpec::new("name", ColumnType::Text),
            ColumnSpec::new("meta", ColumnType::Json),
            ColumnSpec::new("blank", ColumnType::Text),
        ]
    );
}

#[test]
fn duplicate_or_illegal_headers_are_rejected() {
    let headers = vec!["Rate".to_string(), "rate".to_string()];
    assert!(infer_columns(&headers, &[]).is_err());

    let headers = vec!["drop;table".to_string()];
    let err = infer_columns(&headers, &[]).expect_err("should reject header");
    assert!(err.is_configuration());
}

#[test]
fn cells_coerce_to_column_types() {
    assert_eq!(Cell::parse("42", ColumnType::Integer).expect("should parse"), Cell::Int(42));
    assert_eq!(Cell::parse("", ColumnType::Integer).expect("should parse"), Cell::Null);
    assert_eq!(Cell::Int(3).coerce(ColumnType::Float).expect("should widen"), Cell::Float(3.0));
    assert_eq!(
        Cell::Json(json!({"a": 1})).coerce(ColumnType::Text).expect("should stringify"),
        Cell::Text("{\"a\":1}".to_string())
    );
    assert!(Cell::parse("abc", ColumnType::Integer).is_err());
    assert!(Cell::Json(json!([1])).coerce(ColumnType::Integer).is_err());
}

#[tokio::test]
async fn load_csv_and_lookup() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, TextIndexBackend::Sqlite).await;
    let csv_path = dir.path().join("rates.csv");
    std::fs::write(&csv_path, "Role,Rate\nengineer,55.5\nanalyst,40\n").expect("should write csv");

    let (table, inserted) = CustomTable::load_csv(Arc::clone(&index), "Rates", &csv_path)
        .await
        .expect("should load csv");
    assert_eq!(inserted, 2);
    assert_eq!(table.name(), "rates");

    let rows = table
        .lookup("Role", Cell::Text("analyst".into()))
        .await
        .expect("should look up");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["rate"], json!(40.0));
    assert_eq!(table.rows().await.expect("should list").len(), 2);

    table.drop().await.expect("should drop");
}

#[tokio::test]
async fn load_json_lines() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, TextIndexBackend::Sqlite).await;
    let path = dir.path().join("people.jsonl");
    std::fs::write(
        &path,
        "{\"name\": \"Ann\", \"age\": 31, \"tags\": [\"a\"]}\n\n{\"name\": \"Bo\", \"city\": \"Oslo\"}\n",
    )
    .expect("should write json lines");

    let (table, inserted) = CustomTable::load_json(index, "people", &path)
        .await
        .expect("should load json");
    assert_eq!(inserted, 2);
    let mut columns = table.columns().to_vec();
    columns.sort_by(|a, b| a.name.cmp(&b.name));
    assert_eq!(
        columns,
        vec![
            ColumnSpec::new("age", ColumnType::Integer),
            ColumnSpec::new("city", ColumnType::Text),
            ColumnSpec::new("name", ColumnType::Text),
            ColumnSpec::new("tags", ColumnType::Json),
        ]
    );

    let bo = table
        .lookup("name", Cell::Text("Bo".into()))
        .await
        .expect("should look up");
    assert_eq!(bo[0]["age"], Value::Null);
    assert_eq!(bo[0]["city"], json!("Oslo"));
}

#[tokio::test]
async fn rejects_collection_name_and_document_store() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, TextIndexBackend::Sqlite).await;
    let columns = vec![ColumnSpec::new("a", ColumnType::Text)];
    assert!(CustomTable::new(Arc::clone(&index), "contracts", columns.clone()).is_err());
    assert!(CustomTable::new(index, "library_cards", columns.clone()).is_err());

    let other = TempDir::new().expect("should create temp dir");
    let store = open_index(&other, TextIndexBackend::DocumentStore).await;
    let err = CustomTable::new(store, "rates", columns).expect_err("should refuse backend");
    assert!(err.is_configuration());
}

#[tokio::test]
async fn insert_rows_checks_width() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_index(&dir, TextIndexBackend::Sqlite).await;
    let table = CustomTable::new(
        index,
        "pairs",
        vec![
            ColumnSpec::new("k", ColumnType::Text),
            ColumnSpec::new("v", ColumnType::Integer),
        ],
    )
    .expect("should describe table");
    table.create().await.expect("should create");

    assert!(table.insert_rows(vec![vec![Cell::Text("x".into())]]).await.is_err());
    let inserted = table
        .insert_rows(vec![vec![Cell::Text("x".into()), Cell::Text("7".into())]])
        .await
        .expect("should insert");
    assert_eq!(inserted, 1);
    let rows = table.rows().await.expect("should list");
    assert_eq!(rows[0]["v"], json!(7));
}
