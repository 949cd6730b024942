use super::*;
use serde_json::json;
use std::time::{Duration, Instant};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[test]
fn urls_are_joined_without_double_slashes() {
    let client = RestClient::new("http://localhost:6333/").expect("should parse url");
    assert_eq!(client.base_url(), "http://localhost:6333");
    assert_eq!(client.url("/collections/a"), "http://localhost:6333/collections/a");
    assert_eq!(client.url("collections"), "http://localhost:6333/collections");
}

#[test]
fn invalid_base_url_is_configuration_error() {
    let err = RestClient::new("not a url").expect_err("should reject url");
    assert!(err.is_configuration());
}

#[tokio::test]
async fn post_sends_headers_and_parses_json() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/points/search"))
        .and(header("Authorization", "Bearer secret"))
        .and(body_json(json!({"limit": 3})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [1, 2]})))
        .mount(&server)
        .await;

    let client = RestClient::new(&server.uri())
        .expect("should build client")
        .with_bearer(Some("secret"))
        .with_retry_attempts(1);
    let body = client
        .post("points/search", &json!({"limit": 3}))
        .await
        .expect("should post")
        .expect("should find resource");
    assert_eq!(body["result"], json!([1, 2]));
}

#[tokio::test]
async fn not_found_is_none_and_client_errors_fail_fast() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/missing"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .mount(&server)
        .await;

    let client = RestClient::new(&server.uri()).expect("should build client");
    assert!(client.get("missing").await.expect("should get").is_none());
    assert!(!client.delete("missing").await.expect("should delete"));

    let err = client.put("bad", &json!({})).await.expect_err("should fail");
    assert!(matches!(err, IndexError::Network(_)));
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let client = RestClient::new(&server.uri())
        .expect("should build client")
        .with_retry_attempts(2);
    let body = client.get("flaky").await.expect("should succeed on retry");
    assert_eq!(body, Some(Value::Null));
}

#[tokio::test]
async fn slow_responses_leave_the_runtime_free() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"ok": true}))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let client = RestClient::new(&server.uri()).expect("should build client");
    let started = Instant::now();
    let (body, ticked_after) = tokio::join!(client.get("slow"), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        started.elapsed()
    });

    assert_eq!(body.expect("should get"), Some(json!({"ok": true})));
    assert!(
        ticked_after < Duration::from_millis(200),
        "timer fired only after {:?}",
        ticked_after
    );
}
