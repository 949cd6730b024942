use super::*;
use serde_json::json;
use wiremock::matchers::{body_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer, dims: u32, batch_size: u32) -> OllamaConfig {
    let address = server.address();
    OllamaConfig {
        protocol: "http".to_string(),
        host: address.ip().to_string(),
        port: address.port(),
        model: "mini".to_string(),
        batch_size,
        embedding_dimension: dims,
    }
}

#[test]
fn client_configuration() {
    let config = OllamaConfig {
        protocol: "http".to_string(),
        host: "test-host".to_string(),
        port: 1234,
        model: "test-model".to_string(),
        batch_size: 128,
        embedding_dimension: 384,
    };
    let client = OllamaClient::new(&config).expect("should create client");

    assert_eq!(client.model, "test-model");
    assert_eq!(client.batch_size, 128);
    assert_eq!(client.base_url.host_str(), Some("test-host"));
    assert_eq!(client.base_url.port(), Some(1234));
    assert_eq!(client.retry_attempts, DEFAULT_RETRY_ATTEMPTS);
    assert_eq!(client.model_name(), "test-model");
    assert_eq!(client.embedding_dims(), 384);
}

#[test]
fn client_builder_methods() {
    let client = OllamaClient::new(&OllamaConfig::default())
        .expect("should create client")
        .with_timeout(Duration::from_secs(60))
        .with_retry_attempts(5);

    assert_eq!(client.retry_attempts, 5);
    assert_eq!(client.dims, DEFAULT_EMBEDDING_DIMENSION);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn embeds_in_server_sized_batches() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_json(json!({"model": "mini", "input": ["a", "b"]})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0, 0.0], [0.0, 1.0]]})),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .and(body_json(json!({"model": "mini", "input": ["c"]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[0.5, 0.5]]})))
        .expect(1)
        .mount(&server)
        .await;

    let client = OllamaClient::new(&config_for(&server, 2, 2))
        .expect("should create client")
        .with_retry_attempts(1);
    let texts = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let vectors = client.embedding(&texts).await.expect("should embed");

    assert_eq!(vectors, vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.5, 0.5]]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn wrong_dimension_is_an_embedding_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/embed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"embeddings": [[1.0, 2.0, 3.0]]})))
        .mount(&server)
        .await;

    let client = OllamaClient::new(&config_for(&server, 2, 8))
        .expect("should create client")
        .with_retry_attempts(1);
    let err = client
        .embedding(&["x".to_string()])
        .await
        .expect_err("should reject dimension");
    assert!(matches!(err, IndexError::Embedding(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn validate_model_lists_tags() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tags"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"models": [{"name": "other"}]})),
        )
        .mount(&server)
        .await;

    let client = OllamaClient::new(&config_for(&server, 2, 8))
        .expect("should create client")
        .with_retry_attempts(1);
    let err = client.health_check().expect_err("should miss model");
    assert!(err.is_configuration());
}
