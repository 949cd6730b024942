use super::*;
use crate::config::Config;
use crate::vector_store::HitKey;
use tempfile::TempDir;

fn context(dir: &TempDir) -> EngineContext {
    let config = Config {
        base_dir: dir.path().to_path_buf(),
        ..Config::default()
    };
    EngineContext::from_config(&config, "payroll", "mini", 3)
}

fn entry(id: &str, vector: Vec<f32>) -> EmbeddedBlock {
    EmbeddedBlock {
        id: id.to_string(),
        doc_id: 1,
        position: 0,
        text: id.to_string(),
        vector,
    }
}

#[tokio::test]
async fn upsert_replaces_and_query_ranks_by_cosine_distance() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = LanceDbStore::connect(&context(&dir))
        .await
        .expect("should connect");
    assert!(store.query(&[1.0, 0.0, 0.0], 3).await.expect("should query").is_empty());

    store.ensure_index().await.expect("should create table");
    store.ensure_index().await.expect("should attach to table");
    store
        .upsert(&[entry("1", vec![1.0, 0.0, 0.0]), entry("2", vec![0.0, 1.0, 0.0])])
        .await
        .expect("should insert");
    store
        .upsert(&[entry("2", vec![0.0, 0.0, 1.0])])
        .await
        .expect("should replace");

    let hits = store.query(&[1.0, 0.0, 0.0], 5).await.expect("should query");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].key, HitKey::Id("1".to_string()));
    assert!(hits[0].distance < 1e-4);

    let hits = store.query(&[0.0, 0.0, 1.0], 1).await.expect("should query");
    assert_eq!(hits[0].key, HitKey::Id("2".to_string()));

    store.delete_index().await.expect("should drop");
    store.delete_index().await.expect("should drop again");
}

#[tokio::test]
async fn wrong_dimension_is_rejected() {
    let dir = TempDir::new().expect("should create temp dir");
    let store = LanceDbStore::connect(&context(&dir))
        .await
        .expect("should connect");
    store.ensure_index().await.expect("should create table");
    assert!(store.upsert(&[entry("1", vec![1.0])]).await.is_err());
}

#[test]
fn id_predicate_escapes_quotes() {
    assert_eq!(
        id_predicate(&[entry("a'b", vec![]), entry("7", vec![])]),
        "id IN ('a''b', '7')"
    );
}
