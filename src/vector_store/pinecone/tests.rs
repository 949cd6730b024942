use super::*;
use crate::test_support::{embedded, engine_context};
use crate::vector_store::HitKey;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// One mock server plays both the control plane and the index host.
fn store_for(server: &MockServer, dir: &TempDir, timeout_secs: u64) -> PineconeStore {
    let mut context = engine_context(dir, 2);
    context.settings.pinecone.controller_url = server.uri();
    context.settings.pinecone.api_key = Some("pc-key".to_string());
    context.settings.pinecone.readiness_timeout_secs = timeout_secs;
    PineconeStore::new(&context)
        .expect("should build store")
        .with_poll_interval(Duration::from_millis(10))
}

fn description(server: &MockServer, ready: bool) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "host": server.uri(),
        "status": {"ready": ready, "state": if ready { "Ready" } else { "Initializing" }},
    }))
}

fn summary(embedded_blocks: u64) -> EmbeddingSummary {
    EmbeddingSummary::new(embedded_blocks, embedded_blocks, 2)
}

#[test]
fn api_key_is_required() {
    let dir = TempDir::new().expect("should create temp dir");
    let context = engine_context(&dir, 2);
    let err = PineconeStore::new(&context)
        .err()
        .expect("should need an api key");
    assert!(err.is_configuration());
}

#[tokio::test]
async fn creates_serverless_index_and_waits_for_ready() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir, 5);
    let index_path = format!("/indexes/{}", store.collection_name());

    Mock::given(method("GET"))
        .and(path(index_path.as_str()))
        .respond_with(ResponseTemplate::new(404))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(index_path.as_str()))
        .respond_with(description(&server, false))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(index_path.as_str()))
        .respond_with(description(&server, true))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/indexes"))
        .and(header("Api-Key", "pc-key"))
        .and(body_partial_json(json!({
            "dimension": 2,
            "metric": "cosine",
            "spec": {"serverless": {"cloud": "aws", "region": "us-east-1"}},
        })))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({"name": "x"})))
        .expect(1)
        .mount(&server)
        .await;

    store.ensure_index().await.expect("should create index");
}

#[tokio::test]
async fn finish_job_polls_until_vectors_are_visible() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir, 5);

    Mock::given(method("GET"))
        .and(path(format!("/indexes/{}", store.collection_name())))
        .respond_with(description(&server, true))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/describe_index_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"namespaces": {"default": {"vectorCount": 1}}}),
        ))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/describe_index_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"namespaces": {"default": {"vectorCount": 2}}}),
        ))
        .expect(1)
        .mount(&server)
        .await;

    store.finish_job(&summary(2)).await.expect("should wait");
}

#[tokio::test]
async fn finish_job_gives_up_quietly_after_timeout() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir, 0);

    Mock::given(method("GET"))
        .and(path(format!("/indexes/{}", store.collection_name())))
        .respond_with(description(&server, true))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/describe_index_stats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"namespaces": {}})))
        .mount(&server)
        .await;

    store
        .finish_job(&summary(3))
        .await
        .expect("timeout only warns");
}

#[tokio::test]
async fn upsert_and_query_use_the_index_host() {
    let server = MockServer::start().await;
    let dir = TempDir::new().expect("should create temp dir");
    let store = store_for(&server, &dir, 5);

    Mock::given(method("GET"))
        .and(path(format!("/indexes/{}", store.collection_name())))
        .respond_with(description(&server, true))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vectors/upsert"))
        .and(body_partial_json(json!({"namespace": "default", "vectors": [{"id": "3"}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"upsertedCount": 1})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/query"))
        .and(body_partial_json(json!({"topK": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(
            json!({"matches": [{"id": "3", "score": 0.8}]}),
        ))
        .mount(&server)
        .await;

    store
        .upsert(&[embedded("3", 0, vec![0.6, 0.8])])
        .await
        .expect("should upsert");
    let hits = store.query(&[0.6, 0.8], 1).await.expect("should query");
    assert_eq!(hits[0].key, HitKey::Id("3".to_string()));
    assert!((hits[0].distance - 0.2).abs() < 1e-6);
}
