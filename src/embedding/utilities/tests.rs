use super::*;
use crate::config::TextIndexBackend;
use crate::test_support::{seeded_index, seeded_index_on};
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn empty_model_name_is_rejected() {
    let dir = TempDir::new().expect("should create temp dir");
    let (index, _) = seeded_index(&dir, &["a"]).await;
    let err = EmbeddingUtilities::new(index, "lancedb", "  ")
        .err()
        .expect("should reject model");
    assert!(matches!(err, IndexError::MissingModel));
}

#[tokio::test]
async fn key_token_flags_and_summary() {
    let dir = TempDir::new().expect("should create temp dir");
    let (index, ids) = seeded_index(&dir, &["wages", "tax", "leave"]).await;
    let utilities = EmbeddingUtilities::new(index, "qdrant", "mini").expect("should build");
    assert_eq!(utilities.library_name(), "payroll");
    assert_eq!(utilities.flag_key(), naming::flag_key("qdrant", "mini"));

    let (pending, _) = utilities.get_blocks_cursor(None).await.expect("should scope");
    assert_eq!(pending, 3);

    let next = utilities
        .update_text_index(&ids[..2], FlagStrategy::KeyToken, 0)
        .await
        .expect("should flag");
    assert_eq!(next, 2);

    let block = utilities
        .lookup_text_index(&ids[0])
        .await
        .expect("should look up")
        .expect("block exists");
    assert_eq!(
        block.embedding_flag(utilities.flag_key()),
        Some(&json!(utilities.flag_key()))
    );

    let (pending, mut cursor) = utilities.get_blocks_cursor(None).await.expect("should scope");
    assert_eq!(pending, 1);
    assert_eq!(cursor.pull_all().await.expect("should drain")[0].id(), ids[2]);

    let summary = utilities
        .generate_embedding_summary(2, 16)
        .await
        .expect("should summarize");
    assert_eq!(summary.embeddings_created, 2);
    assert_eq!(summary.embedded_blocks, 2);
    assert_eq!(summary.embedding_dims, 16);

    assert_eq!(utilities.unset_text_index().await.expect("should unset"), 2);
    assert_eq!(utilities.count_embedded_blocks().await.expect("should count"), 0);
}

#[tokio::test]
async fn sequential_positions_support_reverse_lookup() {
    let dir = TempDir::new().expect("should create temp dir");
    let (index, ids) = seeded_index(&dir, &["a", "b", "c"]).await;
    let utilities = EmbeddingUtilities::new(index, "hnsw", "mini").expect("should build");

    let next = utilities
        .update_text_index(&ids[..2], FlagStrategy::Sequential, 0)
        .await
        .expect("should flag");
    assert_eq!(next, 2);
    let next = utilities
        .update_text_index(&ids[2..], FlagStrategy::Sequential, next)
        .await
        .expect("should flag");
    assert_eq!(next, 3);

    for (position, id) in ids.iter().enumerate() {
        let block = utilities
            .lookup_embedding_flag(position as i64)
            .await
            .expect("should look up")
            .expect("position is flagged");
        assert_eq!(block.id(), id);
    }
    assert!(utilities
        .lookup_embedding_flag(7)
        .await
        .expect("should look up")
        .is_none());
}

#[tokio::test]
async fn doc_scoped_cursor_includes_flagged_blocks() {
    let dir = TempDir::new().expect("should create temp dir");
    let (index, ids) = seeded_index(&dir, &["a", "b", "c"]).await;
    let utilities = EmbeddingUtilities::new(index, "sqlite", "mini").expect("should build");
    utilities
        .update_text_index(&ids, FlagStrategy::KeyToken, 0)
        .await
        .expect("should flag");

    let (count, mut cursor) = utilities
        .get_blocks_cursor(Some(&[2]))
        .await
        .expect("should scope to documents");
    assert_eq!(count, 1);
    assert_eq!(cursor.pull_all().await.expect("should drain")[0].id(), ids[1]);
}

#[tokio::test]
async fn non_integer_hit_id_names_no_relational_block() {
    let dir = TempDir::new().expect("should create temp dir");
    let (index, ids) = seeded_index(&dir, &["wages"]).await;
    let utilities = EmbeddingUtilities::new(index, "qdrant", "mini").expect("should build");

    assert!(utilities
        .lookup_text_index("no-such-block")
        .await
        .expect("unknown ids should not fail the search")
        .is_none());
    assert!(utilities
        .lookup_text_index(&ids[0])
        .await
        .expect("should look up")
        .is_some());
}

#[tokio::test]
async fn document_store_flags_a_batch_in_order() {
    let dir = TempDir::new().expect("should create temp dir");
    let (index, ids) =
        seeded_index_on(&dir, TextIndexBackend::DocumentStore, &["a", "b", "c", "d"]).await;
    let utilities = EmbeddingUtilities::new(index, "hnsw", "mini").expect("should build");

    let next = utilities
        .update_text_index(&ids[1..], FlagStrategy::Sequential, 5)
        .await
        .expect("should flag");
    assert_eq!(next, 8);
    assert_eq!(utilities.count_embedded_blocks().await.expect("should count"), 3);

    for (position, id) in (5..).zip(&ids[1..]) {
        let block = utilities
            .lookup_embedding_flag(position)
            .await
            .expect("should look up")
            .expect("block exists");
        assert_eq!(block.id(), id);
    }
    let untouched = utilities
        .lookup_text_index(&ids[0])
        .await
        .expect("should look up")
        .expect("block exists");
    assert!(untouched.embedding_flag(utilities.flag_key()).is_none());

    let err = utilities
        .update_text_index(&["missing".to_string()], FlagStrategy::KeyToken, 0)
        .await
        .expect_err("unknown block should fail");
    assert!(matches!(err, IndexError::TextIndex(_)));
}
