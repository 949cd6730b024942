use super::*;
use crate::config::TextIndexConfig;
use serde_json::json;
use tempfile::TempDir;

async fn open_library(dir: &TempDir, backend: TextIndexBackend) -> Arc<dyn TextIndex> {
    let config = TextIndexConfig {
        backend,
        ..TextIndexConfig::default()
    };
    let index = open(&config, dir.path(), "acct", "Payroll-2024")
        .await
        .expect("should open text index");
    index.build_text_index().await.expect("should build");
    index
        .save_library_card(&LibraryCard::new("payroll_2024", "acct"))
        .await
        .expect("should save card");
    index
}

async fn seed(writer: &CollectionWriter) -> Vec<String> {
    let mut ids = Vec::new();
    for (doc, block, text) in [
        (1, 0, "Net wages paid monthly"),
        (1, 1, "Overtime wages"),
        (2, 0, "Holiday policy"),
    ] {
        let block = Block::new()
            .with("doc_ID", doc)
            .with("block_ID", block)
            .with("page_num", doc)
            .with("text_search", text);
        ids.push(writer.write_new_record(&block).await.expect("should write"));
    }
    ids
}

#[tokio::test]
async fn open_normalizes_collection_name() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_library(&dir, TextIndexBackend::Sqlite).await;
    assert_eq!(index.collection_name(), "payroll_2024");
    assert_eq!(index.account_name(), "acct");

    let config = TextIndexConfig::default();
    let err = open(&config, dir.path(), "acct", "library_cards")
        .await
        .err()
        .expect("should reject reserved name");
    assert!(err.is_configuration());
}

#[tokio::test]
async fn retrieval_facade_on_each_embedded_backend() {
    for backend in [TextIndexBackend::Sqlite, TextIndexBackend::DocumentStore] {
        let dir = TempDir::new().expect("should create temp dir");
        let index = open_library(&dir, backend).await;
        let writer = CollectionWriter::new(Arc::clone(&index));
        let retrieval = CollectionRetrieval::new(Arc::clone(&index));
        let ids = seed(&writer).await;

        assert_eq!(retrieval.backend(), backend);
        assert_eq!(retrieval.basic_query("wages").await.expect("should query").len(), 2);
        assert_eq!(retrieval.lookup("_id", ids[2].as_str()).await.expect("should look up").len(), 1);
        assert_eq!(retrieval.filter_by_key("doc_ID", 1).await.expect("should filter").len(), 2);
        assert_eq!(
            retrieval
                .filter_by_key_value_range("block_ID", vec![FieldValue::Int(1)])
                .await
                .expect("should filter set")
                .len(),
            1
        );
        assert_eq!(
            retrieval.filter_by_key_ne_value("doc_ID", 1).await.expect("should filter").len(),
            1
        );
        assert_eq!(
            retrieval
                .text_search_with_key_low_high_range("wages", "page_num", 1, 1)
                .await
                .expect("should search range")
                .len(),
            2
        );
        assert_eq!(
            retrieval
                .text_search_with_key_value_range("wages", "block_ID", vec![FieldValue::Int(0)])
                .await
                .expect("should search set")
                .len(),
            1
        );

        let mut dict = BTreeMap::new();
        dict.insert("doc_ID".to_string(), FilterValue::One(FieldValue::Int(1)));
        dict.insert(
            "block_ID".to_string(),
            FilterValue::Many(vec![FieldValue::Int(1), FieldValue::Int(5)]),
        );
        let hits = retrieval
            .text_search_with_key_value_dict_filter("overtime", &dict)
            .await
            .expect("should search dict");
        assert_eq!(hits.len(), 1);

        let mut cursor = retrieval.get_whole_collection().await.expect("should scan");
        assert_eq!(cursor.pull_all().await.expect("should drain").len(), 3);
        assert_eq!(retrieval.count_documents(&[]).await.expect("should count"), 3);
    }
}

#[tokio::test]
async fn unknown_filter_key_is_configuration_error() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_library(&dir, TextIndexBackend::Sqlite).await;
    let retrieval = CollectionRetrieval::new(index);

    let err = retrieval
        .filter_by_key("colour", "blue")
        .await
        .expect_err("should reject key");
    assert!(err.is_configuration());
}

#[tokio::test]
async fn writer_rejects_key_updates_and_replaces_records() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_library(&dir, TextIndexBackend::Sqlite).await;
    let writer = CollectionWriter::new(Arc::clone(&index));
    let retrieval = CollectionRetrieval::new(index);
    seed(&writer).await;

    let err = writer
        .update_one_record(&[Filter::equals("doc_ID", 1)], "_id", "5")
        .await
        .expect_err("should reject key update");
    assert!(err.is_configuration());

    let replacement = Block::new().with("doc_ID", 2).with("text_search", "Revised holiday policy");
    writer
        .replace_record(&[Filter::equals("doc_ID", 2)], &replacement)
        .await
        .expect("should replace");
    let docs = retrieval.filter_by_key("doc_ID", 2).await.expect("should filter");
    assert_eq!(docs.len(), 1);
    assert_eq!(docs[0].text_search(), "Revised holiday policy");
}

#[tokio::test]
async fn ledger_updates_through_writer() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_library(&dir, TextIndexBackend::Sqlite).await;
    let writer = CollectionWriter::new(Arc::clone(&index));

    writer
        .update_library_card(EmbeddingRecord::completed("mini", "lancedb", 384, 10), false)
        .await
        .expect("should record");
    let card = writer
        .update_library_card(EmbeddingRecord::completed("mini", "lancedb", 384, 25), false)
        .await
        .expect("should record again");
    assert_eq!(card.embedding.len(), 1);
    assert_eq!(card.embedding[0].embedded_blocks, 25);

    let card = writer
        .update_library_card(EmbeddingRecord::completed("mini", "lancedb", 384, 0), true)
        .await
        .expect("should remove");
    assert_eq!(card.embedding.len(), 1);
    assert!(card.embedding[0].is_placeholder());
}

#[tokio::test]
async fn flags_written_through_facade() {
    let dir = TempDir::new().expect("should create temp dir");
    let index = open_library(&dir, TextIndexBackend::Sqlite).await;
    let writer = CollectionWriter::new(Arc::clone(&index));
    let retrieval = CollectionRetrieval::new(index);
    let ids = seed(&writer).await;

    writer
        .add_new_embedding_flag(&ids[0], "qdrant_mini", &json!("qdrant_mini"))
        .await
        .expect("should flag");
    assert_eq!(retrieval.count_embedded_blocks("qdrant_mini").await.expect("should count"), 1);
    assert_eq!(writer.unset_embedding_flag("qdrant_mini").await.expect("should unset"), 1);
    assert_eq!(retrieval.count_embedded_blocks("qdrant_mini").await.expect("should count"), 0);
}
