use super::*;
use crate::text_index::model::FieldValue;
use serde_json::json;

#[test]
fn field_list_order() {
    assert_eq!(BLOCK_FIELDS.len(), 28);
    assert_eq!(BLOCK_FIELDS[0].name, "_id");
    assert_eq!(BLOCK_FIELDS[2].name, "doc_ID");
    assert_eq!(BLOCK_FIELDS[27].name, "embedding_flags");
    assert_eq!(insert_fields().count(), 27);
}

#[test]
fn safe_name_normalizes() {
    assert_eq!(safe_name("Contracts-2024").expect("should be safe"), "contracts_2024");
    assert_eq!(safe_name(" my.lib ").expect("should be safe"), "my_lib");
}

#[test]
fn safe_name_rejects_reserved_and_illegal() {
    for bad in [
        "",
        "library_cards",
        "LIBRARY-CARDS",
        "embedding_status",
        "notes_fts",
        "semi;colon",
        "quote\"d",
        "9lives",
    ] {
        let err = safe_name(bad).expect_err("should reject name");
        assert!(err.is_configuration(), "{bad:?} gave {err}");
    }
    assert!(safe_name(&"a".repeat(64)).is_err());
    assert!(safe_name(&"a".repeat(63)).is_ok());
}

#[test]
fn shape_block_fills_defaults_and_drops_key() {
    let block = Block::new()
        .with("_id", "99")
        .with("doc_ID", "7")
        .with("text_search", "hello")
        .with("page_num", 2);
    let shaped = shape_block(&block).expect("should shape block");

    assert!(shaped.get("_id").is_none());
    assert_eq!(shaped.get("doc_ID"), Some(&json!(7)));
    assert_eq!(shaped.get("page_num"), Some(&json!(2)));
    assert_eq!(shaped.get("coords_x"), Some(&json!(0)));
    assert_eq!(shaped.get("file_source"), Some(&json!("")));
    assert_eq!(shaped.get("embedding_flags"), Some(&json!({})));
    assert_eq!(shaped.as_map().len(), 27);
}

#[test]
fn shape_block_rejects_unknown_fields_and_bad_integers() {
    let unknown = Block::new().with("colour", "blue");
    assert!(shape_block(&unknown).is_err());

    let bad_int = Block::new().with("doc_ID", "seven");
    assert!(shape_block(&bad_int).is_err());
}

#[test]
fn parsing_record_is_stamped() {
    let shaped = shape_parsing_record(&Block::new()).expect("should shape record");
    assert!(!shaped
        .get_str("added_to_collection")
        .unwrap_or_default()
        .is_empty());
}

#[test]
fn normalize_rejects_unknown_keys() {
    let err = normalize_filters(&[Filter::equals("colour", "blue")])
        .expect_err("should reject unknown key");
    assert!(err.is_configuration());

    let err = normalize_filters(&[Filter::equals("embedding_flags", "x")])
        .expect_err("should reject flags key");
    assert!(err.is_configuration());
}

#[test]
fn normalize_coerces_by_kind() {
    let filters = normalize_filters(&[
        Filter::equals("doc_ID", "3"),
        Filter::equals("page_num", 4),
        Filter::equals("file_source", 12),
    ])
    .expect("should normalize");
    assert_eq!(
        filters,
        vec![
            Filter::equals("doc_ID", 3),
            Filter::equals("page_num", 4),
            Filter::equals("file_source", "12"),
        ]
    );
}

#[test]
fn render_sqlite_where() {
    let mut next = 1;
    let rendered = render_where(
        &[
            Filter::equals("content_type", "text"),
            Filter::one_of("doc_ID", vec![FieldValue::Int(1), FieldValue::Int(2)]),
            Filter::range("page_num", 1, 5),
        ],
        Dialect::Sqlite,
        &mut next,
    )
    .expect("should render");

    assert_eq!(
        rendered.clause,
        "\"content_type\" = ? AND \"doc_ID\" IN (?, ?) AND \"page_num\" BETWEEN ? AND ?"
    );
    assert_eq!(rendered.binds.len(), 5);
    assert_eq!(next, 6);
}

#[test]
fn render_postgres_where_numbers_placeholders() {
    let mut next = 3;
    let rendered = render_where(
        &[
            Filter::not_equals("file_type", "pdf"),
            Filter::equals("_id", "42"),
        ],
        Dialect::Postgres,
        &mut next,
    )
    .expect("should render");

    assert_eq!(rendered.clause, "\"file_type\" <> $3 AND \"_id\" = $4");
    assert_eq!(
        rendered.binds,
        vec![FieldValue::Text("pdf".to_string()), FieldValue::Int(42)]
    );
    assert_eq!(rendered.and_sql(), " AND \"file_type\" <> $3 AND \"_id\" = $4");
}

#[test]
fn empty_value_set_matches_nothing() {
    let mut next = 1;
    let rendered = render_where(&[Filter::one_of("doc_ID", vec![])], Dialect::Sqlite, &mut next)
        .expect("should render");
    assert_eq!(rendered.clause, "1 = 0");
    assert!(rendered.binds.is_empty());
}

#[test]
fn no_filters_render_nothing() {
    let mut next = 1;
    let rendered = render_where(&[], Dialect::Postgres, &mut next).expect("should render");
    assert!(rendered.is_empty());
    assert_eq!(rendered.where_sql(), "");
}

#[test]
fn decode_in_storage_order() {
    let mut seen = Vec::new();
    let block = decode_block(|idx, spec| {
        seen.push(idx);
        Ok(default_value(spec.kind))
    })
    .expect("should decode");
    assert_eq!(seen, (0..28).collect::<Vec<_>>());
    assert_eq!(block.as_map().len(), 28);
}
