use super::*;
use crate::test_support::{embedded, engine_context};
use crate::vector_store::HitKey;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn store_for(server: &MockServer, dir: &TempDir) -> MilvusStore {
    let mut context = engine_context(dir, 3);
    context.settings.milvus.url = server.uri();
    context.settings.milvus.token = Some("root:Milvus".to_string());
    MilvusStore::new(&context).expect("should build store")
}

async fn mount_has(server: &MockServer, has: bool) {
    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/has"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {"has": has}})),
        )
        .mount(server)
        .await;
}

#[tokio::test]
async fn creates_collection_with_cosine_index() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir);
    mount_has(&server, false).await;

    Mock::given(method("POST"))
        .and(path("/v2/vectordb/collections/create"))
        .and(header("Authorization", "Bearer root:Milvus"))
        .and(body_partial_json(json!({
            "collectionName": store.collection_name(),
            "indexParams": [{"metricType": "COSINE"}],
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": {}})))
        .expect(1)
        .mount(&server)
        .await;

    store.ensure_index().await.expect("should create collection");
}

#[tokio::test]
async fn non_zero_code_is_an_error() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir);

    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/upsert"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"code": 1100, "message": "dimension mismatch"})),
        )
        .mount(&server)
        .await;

    let err = store
        .upsert(&[embedded("1", 0, vec![0.1, 0.2, 0.3])])
        .await
        .expect_err("should surface the Milvus error");
    assert!(err.to_string().contains("dimension mismatch"));
}

#[tokio::test]
async fn search_reads_block_ids_and_similarity() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir);
    mount_has(&server, true).await;

    Mock::given(method("POST"))
        .and(path("/v2/vectordb/entities/search"))
        .and(body_partial_json(json!({"annsField": "vector", "limit": 2})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "data": [
            {"block_id": "5", "distance": 0.9},
            {"block_id": "8", "distance": 0.4},
        ]})))
        .mount(&server)
        .await;

    let hits = store.query(&[1.0, 0.0, 0.0], 2).await.expect("should search");
    assert_eq!(hits.len(), 2);
    assert_eq!(hits[0].key, HitKey::Id("5".to_string()));
    assert!((hits[0].distance - 0.1).abs() < 1e-6);
}

#[tokio::test]
async fn search_on_missing_collection_is_empty() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir);
    mount_has(&server, false).await;

    assert!(store.query(&[1.0, 0.0, 0.0], 2).await.expect("should query").is_empty());
}
