use super::*;
use serde_json::json;
use std::collections::BTreeMap;

fn record(engine: &str, model: &str, embedded_blocks: u64) -> EmbeddingRecord {
    EmbeddingRecord::completed(model, engine, 384, embedded_blocks)
}

#[test]
fn new_card_carries_placeholder() {
    let card = LibraryCard::new("contracts", "default");
    assert_eq!(card.embedding.len(), 1);
    assert!(card.embedding[0].is_placeholder());
    assert_eq!(card.embedding[0].embedding_status, "no");
}

#[test]
fn repeated_updates_overwrite_one_entry() {
    let mut card = LibraryCard::new("contracts", "default");

    card.merge_embedding_record(record("A", "m1", 10), false);
    card.merge_embedding_record(record("A", "m1", 25), false);

    assert_eq!(card.embedding.len(), 1);
    assert_eq!(card.embedding[0].embedded_blocks, 25);
    assert!(!card.embedding[0].is_placeholder());
}

#[test]
fn update_keeps_position_of_existing_entry() {
    let mut card = LibraryCard::new("contracts", "default");
    card.merge_embedding_record(record("A", "m1", 10), false);
    card.merge_embedding_record(record("B", "m1", 3), false);
    card.merge_embedding_record(record("A", "m1", 12), false);

    let engines: Vec<&str> = card
        .embedding
        .iter()
        .map(|r| r.embedding_db.as_str())
        .collect();
    assert_eq!(engines, vec!["A", "B"]);
    assert_eq!(card.embedding[0].embedded_blocks, 12);
}

#[test]
fn delete_removes_only_the_target_entry() {
    let mut card = LibraryCard::new("contracts", "default");
    card.merge_embedding_record(record("A", "m1", 10), false);
    card.merge_embedding_record(record("A", "m2", 7), false);
    card.merge_embedding_record(record("B", "m1", 4), false);

    card.merge_embedding_record(record("A", "m1", 0), true);

    assert_eq!(card.embedding.len(), 2);
    assert!(card.embedding_record("m1", "A").is_none());
    assert!(card.embedding_record("m2", "A").is_some());
    assert!(card.embedding_record("m1", "B").is_some());
}

#[test]
fn deleting_last_entry_restores_placeholder() {
    let mut card = LibraryCard::new("contracts", "default");
    card.merge_embedding_record(record("A", "m1", 10), false);
    card.merge_embedding_record(record("A", "m1", 10), true);

    assert_eq!(card.embedding, vec![EmbeddingRecord::placeholder()]);
}

#[test]
fn block_accessors() {
    let block = Block::new()
        .with("_id", "17")
        .with("doc_ID", 3)
        .with("block_ID", "4")
        .with("text_search", "net wages paid")
        .with("embedding_flags", json!({"lancedb_m1": "lancedb_m1", "hnsw_m1": 5}));

    assert_eq!(block.id(), "17");
    assert_eq!(block.doc_id(), Some(3));
    assert_eq!(block.block_id(), Some(4));
    assert_eq!(block.text_search(), "net wages paid");
    assert_eq!(block.embedding_flag("hnsw_m1"), Some(&json!(5)));
    assert!(block.embedding_flag("qdrant_m1").is_none());
}

#[test]
fn filters_from_dictionary() {
    let dict: BTreeMap<String, FilterValue> = serde_json::from_value(json!({
        "doc_ID": [1, 2],
        "content_type": "text"
    }))
    .expect("should parse filter dictionary");

    let filters = Filter::from_dict(&dict);
    assert_eq!(
        filters,
        vec![
            Filter::equals("content_type", "text"),
            Filter::one_of("doc_ID", vec![FieldValue::Int(1), FieldValue::Int(2)]),
        ]
    );
}

#[test]
fn field_value_conversions() {
    assert_eq!(FieldValue::from_json(&json!(5)), Some(FieldValue::Int(5)));
    assert_eq!(
        FieldValue::from_json(&json!("x")),
        Some(FieldValue::Text("x".to_string()))
    );
    assert_eq!(FieldValue::from_json(&json!(null)), None);
    assert_eq!(FieldValue::Text(" 12 ".to_string()).as_i64(), Some(12));
    assert_eq!(FieldValue::Int(3).to_string(), "3");
}
