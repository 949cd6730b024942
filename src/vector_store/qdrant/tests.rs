use super::*;
use crate::test_support::{embedded, engine_context};
use crate::vector_store::HitKey;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn store_for(server: &MockServer, dir: &TempDir) -> QdrantStore {
    let mut context = engine_context(dir, 2);
    context.settings.qdrant.url = server.uri();
    context.settings.qdrant.api_key = Some("k".to_string());
    QdrantStore::new(&context).expect("should build store")
}

#[tokio::test]
async fn creates_missing_collection_and_upserts_uuid_points() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir).await;
    let collection_path = format!("/collections/{}", store.collection_name());

    Mock::given(method("GET"))
        .and(path(collection_path.as_str()))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(collection_path.as_str()))
        .and(body_partial_json(json!({"vectors": {"size": 2, "distance": "Cosine"}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path(format!("{}/points", collection_path)))
        .and(body_partial_json(json!({"points": [{
            "id": point_uuid("7").to_string(),
            "payload": {"_id": "7", "doc_ID": 1},
        }]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    store.ensure_index().await.expect("should create collection");
    store
        .upsert(&[embedded("7", 0, vec![0.1, 0.2])])
        .await
        .expect("should upsert");
}

#[tokio::test]
async fn search_converts_scores_to_distances() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir).await;

    Mock::given(method("POST"))
        .and(path(format!("/collections/{}/points/search", store.collection_name())))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [
            {"id": "x", "score": 0.75, "payload": {"_id": "3"}},
            {"id": "y", "score": 0.5, "payload": {"_id": "9"}},
        ]})))
        .mount(&server)
        .await;

    let hits = store.query(&[1.0, 0.0], 2).await.expect("should search");
    assert_eq!(hits[0].key, HitKey::Id("3".to_string()));
    assert!((hits[0].distance - 0.25).abs() < 1e-6);
    assert!((hits[1].distance - 0.5).abs() < 1e-6);
}

#[tokio::test]
async fn deleting_a_missing_collection_succeeds() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir).await;

    Mock::given(method("DELETE"))
        .and(path(format!("/collections/{}", store.collection_name())))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    store.delete_index().await.expect("should be idempotent");
    assert!(store.query(&[1.0, 0.0], 2).await.expect("should query").is_empty());
}
