#[cfg(test)]
mod tests;

use serde_json::Value;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::{IndexError, Result};

pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
const EXPONENTIAL_BACKOFF_BASE: u64 = 2;

/// Why an HTTP exchange failed after the retry loop gave up.
#[derive(Debug, Error)]
pub enum HttpFailure {
    #[error("HTTP {0}")]
    Status(u16),
    #[error("{0}")]
    Transport(String),
}

impl HttpFailure {
    #[inline]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Status(404))
    }
}

/// Run `request_fn` until it succeeds, retrying server and transport errors with
/// exponential backoff. Client errors (4xx) fail on the first attempt.
pub fn send_with_retry<F>(
    target: &str,
    attempts: u32,
    mut request_fn: F,
) -> std::result::Result<String, HttpFailure>
where
    F: FnMut() -> std::result::Result<String, ureq::Error>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        debug!("HTTP request attempt {}/{} to {}", attempt, attempts, target);

        match request_fn() {
            Ok(response_text) => return Ok(response_text),
            Err(error) => {
                let should_retry = match &error {
                    ureq::Error::StatusCode(status) => {
                        if *status >= 500 {
                            warn!(
                                "Server error (status {}), attempt {}/{}",
                                status, attempt, attempts
                            );
                            true
                        } else {
                            debug!("Client error (status {}), not retrying", status);
                            return Err(HttpFailure::Status(*status));
                        }
                    }
                    ureq::Error::ConnectionFailed
                    | ureq::Error::HostNotFound
                    | ureq::Error::Timeout(_)
                    | ureq::Error::Io(_) => {
                        warn!(
                            "Transport error: {}, attempt {}/{}",
                            error, attempt, attempts
                        );
                        true
                    }
                    _ => false,
                };

                if !should_retry {
                    warn!("Non-retryable error: {}", error);
                    return Err(HttpFailure::Transport(error.to_string()));
                }

                last_error = Some(match error {
                    ureq::Error::StatusCode(status) => HttpFailure::Status(status),
                    other => HttpFailure::Transport(other.to_string()),
                });

                if attempt < attempts {
                    let delay = Duration::from_millis(EXPONENTIAL_BACKOFF_BASE.pow(attempt - 1) * 1000);
                    debug!("Waiting {:?} before retry", delay);
                    std::thread::sleep(delay);
                }
            }
        }
    }

    error!("All retry attempts failed for request to {}", target);
    Err(last_error.unwrap_or_else(|| HttpFailure::Transport("request failed after retries".to_string())))
}

#[derive(Debug, Clone, Copy)]
enum Method {
    Get,
    Post,
    Put,
    Delete,
}

/// JSON client shared by the HTTP vector engines. Requests run on the blocking pool.
///
/// A 404 is not an error: reads return `None` and deletes return `false`, which is
/// what makes attach-or-create and repeated deletes idempotent.
#[derive(Debug, Clone)]
pub struct RestClient {
    base_url: String,
    agent: ureq::Agent,
    headers: Vec<(String, String)>,
    retry_attempts: u32,
}

impl RestClient {
    #[inline]
    pub fn new(base_url: &str) -> Result<Self> {
        let parsed = url::Url::parse(base_url)
            .map_err(|e| IndexError::Config(format!("Invalid engine URL {}: {}", base_url, e)))?;

        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            agent: Self::agent(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)),
            headers: Vec::new(),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        })
    }

    fn agent(timeout: Duration) -> ureq::Agent {
        ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into()
    }

    #[inline]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Adds `Authorization: Bearer <token>` when a non-empty token is configured.
    #[inline]
    pub fn with_bearer(self, token: Option<&str>) -> Self {
        match token.filter(|t| !t.trim().is_empty()) {
            Some(token) => self.with_header("Authorization", &format!("Bearer {}", token)),
            None => self,
        }
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = Self::agent(timeout);
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    #[inline]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[inline]
    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    #[inline]
    pub async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.execute(Method::Get, path, None).await
    }

    #[inline]
    pub async fn post(&self, path: &str, body: &Value) -> Result<Option<Value>> {
        self.execute(Method::Post, path, Some(body)).await
    }

    #[inline]
    pub async fn put(&self, path: &str, body: &Value) -> Result<Option<Value>> {
        self.execute(Method::Put, path, Some(body)).await
    }

    /// Returns `false` when the resource did not exist.
    #[inline]
    pub async fn delete(&self, path: &str) -> Result<bool> {
        Ok(self.execute(Method::Delete, path, None).await?.is_some())
    }

    /// Like [`post`](Self::post) but a missing resource is an error.
    #[inline]
    pub async fn post_required(&self, path: &str, body: &Value) -> Result<Value> {
        self.post(path, body).await?.ok_or_else(|| {
            IndexError::VectorStore(format!("{} returned 404", self.url(path)))
        })
    }

    fn apply<B>(&self, mut request: ureq::RequestBuilder<B>) -> ureq::RequestBuilder<B> {
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }

    /// Runs the blocking exchange, retries and backoff included, on the blocking pool.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let client = self.clone();
        let path = path.to_string();
        let body = body.cloned();
        tokio::task::spawn_blocking(move || client.execute_blocking(method, &path, body.as_ref()))
            .await
            .map_err(|e| IndexError::Network(format!("HTTP task failed: {}", e)))?
    }

    fn execute_blocking(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<Option<Value>> {
        let url = self.url(path);
        let payload = body.map(Value::to_string).unwrap_or_default();
        debug!("{:?} {}", method, url);

        let outcome = send_with_retry(&url, self.retry_attempts, || {
            let response = match method {
                Method::Get => self.apply(self.agent.get(url.as_str())).call(),
                Method::Delete => self.apply(self.agent.delete(url.as_str())).call(),
                Method::Post => self
                    .apply(self.agent.post(url.as_str()))
                    .header("Content-Type", "application/json")
                    .send(&payload),
                Method::Put => self
                    .apply(self.agent.put(url.as_str()))
                    .header("Content-Type", "application/json")
                    .send(&payload),
            };
            response.and_then(|mut resp| resp.body_mut().read_to_string())
        });

        match outcome {
            Ok(text) if text.trim().is_empty() => Ok(Some(Value::Null)),
            Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
                IndexError::VectorStore(format!("Failed to parse response from {}: {}", url, e))
            }),
            Err(failure) if failure.is_not_found() => Ok(None),
            Err(failure) => Err(IndexError::Network(format!(
                "Request to {} failed: {}",
                url, failure
            ))),
        }
    }
}
