use super::*;
use crate::text_index::model::EmbeddingRecord;
use crate::text_index::schema::shape_block;
use serde_json::json;
use tempfile::TempDir;

async fn open_store(dir: &TempDir, collection: &str) -> DocumentStore {
    let store = DocumentStore::open(dir.path(), "acct", collection).expect("should open store");
    store.build_text_index().await.expect("should build");
    store
}

async fn insert(store: &DocumentStore, doc_id: i64, block_id: i64, text: &str) -> String {
    let block = Block::new()
        .with("doc_ID", doc_id)
        .with("block_ID", block_id)
        .with("text_search", text)
        .with("file_type", "pdf");
    store
        .insert_block(&shape_block(&block).expect("should shape"))
        .await
        .expect("should insert")
}

#[tokio::test]
async fn unbuilt_collection_reports_build_required() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = DocumentStore::open(dir.path(), "acct", "notes").expect("should open store");
    assert!(store.check_if_table_build_required().await.expect("should check"));
    assert!(store.find(&[]).await.is_err());

    store.build_text_index().await.expect("should build");
    assert!(!store.check_if_table_build_required().await.expect("should check"));
}

#[tokio::test]
async fn find_keeps_insertion_order() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&dir, "notes").await;
    let first = insert(&store, 2, 0, "first").await;
    let second = insert(&store, 1, 0, "second").await;

    let all = store.find(&[]).await.expect("should find");
    let ids: Vec<&str> = all.iter().map(Block::id).collect();
    assert_eq!(ids, vec![first.as_str(), second.as_str()]);

    let by_doc = store
        .find(&[Filter::equals("doc_ID", 1)])
        .await
        .expect("should filter");
    assert_eq!(by_doc.len(), 1);
    assert_eq!(by_doc[0].id(), second);

    let ranged = store
        .find(&[Filter::range("doc_ID", 1, 2), Filter::not_equals("_id", first.as_str())])
        .await
        .expect("should filter range");
    assert_eq!(ranged.len(), 1);

    assert!(store
        .find(&[Filter::one_of("doc_ID", vec![])])
        .await
        .expect("should filter empty set")
        .is_empty());
}

#[tokio::test]
async fn text_search_is_stemmed_and_conjunctive() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&dir, "notes").await;
    insert(&store, 1, 0, "Net wages paid monthly").await;
    insert(&store, 1, 1, "Wages are reviewed").await;
    insert(&store, 2, 0, "Nothing relevant").await;

    assert_eq!(store.text_search("wage", &[]).await.expect("should search").len(), 2);

    let both = store.text_search("wages paid", &[]).await.expect("should search");
    assert_eq!(both.len(), 1);
    assert_eq!(both[0].text_search(), "Net wages paid monthly");

    let filtered = store
        .text_search("wages", &[Filter::equals("block_ID", 1)])
        .await
        .expect("should search with filter");
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].text_search(), "Wages are reviewed");
}

#[tokio::test]
async fn flags_round_trip() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&dir, "notes").await;
    let first = insert(&store, 1, 0, "one").await;
    insert(&store, 1, 1, "two").await;

    store
        .add_new_embedding_flag(&first, "hnsw_mini", &json!(0))
        .await
        .expect("should flag");
    assert_eq!(store.count_embedded_blocks("hnsw_mini").await.expect("should count"), 1);

    let (pending, mut cursor) = store
        .embedding_job_cursor("hnsw_mini", None)
        .await
        .expect("should open cursor");
    assert_eq!(pending, 1);
    let rest = cursor.pull_all().await.expect("should drain");
    assert_eq!(rest.len(), 1);
    assert_ne!(rest[0].id(), first);

    let hit = store
        .lookup_embedding_flag("hnsw_mini", &json!(0))
        .await
        .expect("should look up")
        .expect("flagged block exists");
    assert_eq!(hit.id(), first);
    assert_eq!(hit.text_search(), "one");

    assert_eq!(store.unset_embedding_flag("hnsw_mini").await.expect("should unset"), 1);
    assert_eq!(store.count_embedded_blocks("hnsw_mini").await.expect("should count"), 0);
}

#[tokio::test]
async fn update_and_delete() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&dir, "notes").await;
    let id = insert(&store, 1, 0, "draft").await;

    let changed = store
        .update_one_record(&[Filter::equals("_id", id.as_str())], "text_search", &json!("final copy"))
        .await
        .expect("should update");
    assert_eq!(changed, 1);
    assert!(store.text_search("draft", &[]).await.expect("should search").is_empty());
    assert_eq!(store.text_search("final", &[]).await.expect("should search").len(), 1);

    assert_eq!(
        store
            .delete_record_by_key("_id", &FieldValue::Text(id))
            .await
            .expect("should delete"),
        1
    );
    assert_eq!(store.count_documents(&[]).await.expect("should count"), 0);
}

#[tokio::test]
async fn cards_are_per_library() {
    let dir = TempDir::new().expect("should create temp dir");
    let notes = open_store(&dir, "notes").await;
    let memos = open_store(&dir, "memos").await;

    let mut card = LibraryCard::new("notes", "acct");
    card.merge_embedding_record(EmbeddingRecord::completed("mini", "hnsw", 8, 3), false);
    notes.save_library_card(&card).await.expect("should save");
    memos
        .save_library_card(&LibraryCard::new("memos", "acct"))
        .await
        .expect("should save");

    assert_eq!(notes.get_and_increment_doc_id().await.expect("should bump"), 1);
    assert_eq!(notes.get_and_increment_doc_id().await.expect("should bump"), 2);
    assert_eq!(memos.get_and_increment_doc_id().await.expect("should bump"), 1);

    notes.save_library_card(&card).await.expect("should save stale card");
    let stored = notes.get_library_card().await.expect("should read").expect("card exists");
    assert_eq!(stored.unique_doc_id, 2);
    assert_eq!(stored.embedding[0].embedding_db, "hnsw");

    notes.delete_collection().await.expect("should delete");
    assert!(notes.get_library_card().await.expect("should read").is_none());
    assert!(memos.get_library_card().await.expect("should read").is_some());
}

#[tokio::test]
async fn distinct_values_and_no_custom_tables() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = open_store(&dir, "notes").await;
    insert(&store, 3, 0, "a").await;
    insert(&store, 1, 0, "b").await;
    insert(&store, 3, 1, "c").await;

    assert_eq!(
        store.get_distinct_list("doc_ID").await.expect("should list"),
        vec![FieldValue::Int(1), FieldValue::Int(3)]
    );

    let err = store.create_table("rates", &[]).await.expect_err("should refuse");
    assert!(err.is_configuration());
}
