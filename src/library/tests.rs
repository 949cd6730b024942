use super::*;
use crate::config::TextIndexBackend;
use tempfile::TempDir;

fn config_in(dir: &TempDir) -> Config {
    Config {
        base_dir: dir.path().to_path_buf(),
        account_name: "acct".to_string(),
        ..Config::default()
    }
}

fn block(doc: i64, text: &str, content_type: &str, page: i64) -> Block {
    Block::new()
        .with("doc_ID", doc)
        .with("block_ID", 0)
        .with("content_type", content_type)
        .with("page_num", page)
        .with("text", text)
        .with("text_search", text)
}

#[tokio::test]
async fn create_writes_a_placeholder_card() {
    let dir = TempDir::new().expect("should create temp dir");
    let library = Library::create(&config_in(&dir), "Payroll-2024")
        .await
        .expect("should create");

    assert_eq!(library.library_name(), "payroll_2024");
    let card = library.get_library_card().await.expect("should read card");
    assert_eq!(card.account_name, "acct");
    assert_eq!(card.embedding, vec![EmbeddingRecord::placeholder()]);
}

#[tokio::test]
async fn open_requires_an_existing_library() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = config_in(&dir);
    let err = Library::open(&config, "missing")
        .await
        .err()
        .expect("should not open");
    assert!(err.is_configuration());

    Library::create(&config, "present").await.expect("should create");
    Library::open(&config, "present").await.expect("should open");
}

#[tokio::test]
async fn add_blocks_assigns_one_doc_id_per_source_document() {
    let dir = TempDir::new().expect("should create temp dir");
    let library = Library::create(&config_in(&dir), "payroll")
        .await
        .expect("should create");

    let ids = library
        .add_blocks(vec![
            block(70, "wages page one", "text", 1),
            block(70, "wages page two", "text", 2),
            block(90, "", "image", 1),
            block(90, "tax table", "table", 1),
        ])
        .await
        .expect("should import");
    assert_eq!(ids.len(), 4);

    let doc_ids = library
        .retrieval()
        .get_distinct_list("doc_ID")
        .await
        .expect("should list");
    let mut doc_ids: Vec<i64> = doc_ids.iter().filter_map(|v| v.as_i64()).collect();
    doc_ids.sort_unstable();
    assert_eq!(doc_ids, vec![1, 2]);

    let card = library.get_library_card().await.expect("should read card");
    assert_eq!(card.blocks, 4);
    assert_eq!(card.documents, 2);
    assert_eq!(card.images, 1);
    assert_eq!(card.tables, 1);
    assert_eq!(card.pages, 3);
    assert_eq!(card.unique_doc_id, 2);
}

#[tokio::test]
async fn ledger_updates_overwrite_one_entry() {
    let dir = TempDir::new().expect("should create temp dir");
    let library = Library::create(&config_in(&dir), "payroll")
        .await
        .expect("should create");

    library
        .update_embedding_status(EmbeddingRecord::completed("m1", "A", 4, 10), false)
        .await
        .expect("should update");
    let card = library
        .update_embedding_status(EmbeddingRecord::completed("m1", "A", 4, 25), false)
        .await
        .expect("should update");
    assert_eq!(card.embedding.len(), 1);
    assert_eq!(card.embedding[0].embedded_blocks, 25);

    let card = library
        .update_embedding_status(EmbeddingRecord::completed("m1", "A", 4, 0), true)
        .await
        .expect("should remove");
    assert_eq!(card.embedding, vec![EmbeddingRecord::placeholder()]);
}

#[tokio::test]
async fn engine_context_points_inside_the_library() {
    let dir = TempDir::new().expect("should create temp dir");
    let library = Library::create(&config_in(&dir), "payroll")
        .await
        .expect("should create");

    let context = library.engine_context("mini", 8);
    assert_eq!(context.library_name, "payroll");
    assert_eq!(context.account_name, "acct");
    assert_eq!(context.dims, 8);
    assert!(context.vector_dir.ends_with("acct/payroll"));
}

#[tokio::test]
async fn delete_removes_blocks_and_card() {
    let dir = TempDir::new().expect("should create temp dir");
    let config = config_in(&dir);
    let library = Library::create(&config, "payroll").await.expect("should create");
    library
        .add_blocks(vec![block(1, "wages", "text", 1)])
        .await
        .expect("should import");

    library.delete().await.expect("should delete");
    assert!(Library::open(&config, "payroll").await.is_err());
}

async fn concurrent_ledger_updates_all_survive(backend: TextIndexBackend) {
    let dir = TempDir::new().expect("should create temp dir");
    let mut config = config_in(&dir);
    config.text_index.backend = backend;
    let library = Library::create(&config, "payroll")
        .await
        .expect("should create");
    library
        .add_blocks(vec![block(1, "wages", "text", 1)])
        .await
        .expect("should import");

    let engines = ["qdrant", "milvus", "chroma", "hnsw"];
    let updates = engines.iter().map(|engine| {
        library.update_embedding_status(EmbeddingRecord::completed("m1", engine, 4, 1), false)
    });
    let (merged, counted) = tokio::join!(
        futures::future::try_join_all(updates),
        library.refresh_counts()
    );
    merged.expect("should update");
    counted.expect("should recount");

    let card = library.get_library_card().await.expect("should read card");
    for engine in engines {
        assert!(
            card.embedding_record("m1", engine).is_some(),
            "{} entry lost",
            engine
        );
    }
    assert_eq!(card.embedding.len(), engines.len());
    assert_eq!(card.blocks, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ledger_updates_survive_on_sqlite() {
    concurrent_ledger_updates_all_survive(TextIndexBackend::Sqlite).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ledger_updates_survive_on_document_store() {
    concurrent_ledger_updates_all_survive(TextIndexBackend::DocumentStore).await;
}

#[tokio::test]
async fn refresh_counts_leaves_the_ledger_alone() {
    let dir = TempDir::new().expect("should create temp dir");
    let library = Library::create(&config_in(&dir), "payroll")
        .await
        .expect("should create");
    library
        .update_embedding_status(EmbeddingRecord::completed("m1", "qdrant", 4, 0), false)
        .await
        .expect("should update");
    let stale = library.get_library_card().await.expect("should read card");

    library
        .update_embedding_status(EmbeddingRecord::completed("m1", "hnsw", 4, 2), false)
        .await
        .expect("should update");
    library
        .writer()
        .update_card_counts(&LibraryCard { blocks: 9, ..stale })
        .await
        .expect("should write counts");

    let card = library.get_library_card().await.expect("should read card");
    assert_eq!(card.blocks, 9);
    assert!(card.embedding_record("m1", "hnsw").is_some());
    assert!(card.embedding_record("m1", "qdrant").is_some());
}
