#[cfg(test)]
mod tests;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use super::EmbeddingModel;
use crate::config::OllamaConfig;
use crate::vector_store::rest::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_TIMEOUT_SECONDS, send_with_retry};
use crate::{IndexError, Result};

/// Output size of the default `nomic-embed-text` model.
pub const DEFAULT_EMBEDDING_DIMENSION: u32 = 768;

/// Blocking client for an Ollama server's embedding endpoint.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    base_url: Url,
    model: String,
    batch_size: u32,
    dims: u32,
    agent: ureq::Agent,
    retry_attempts: u32,
}

#[derive(Debug, Serialize)]
struct BatchEmbedRequest<'a> {
    model: &'a str,
    #[serde(rename = "input")]
    inputs: &'a [String],
}

#[derive(Debug, Deserialize)]
struct BatchEmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Debug, Deserialize)]
pub struct ModelInfo {
    pub name: String,
    pub size: Option<u64>,
    pub digest: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    models: Vec<ModelInfo>,
}

impl OllamaClient {
    #[inline]
    pub fn new(config: &OllamaConfig) -> Result<Self> {
        let base_url = config
            .ollama_url()
            .map_err(|e| IndexError::Config(format!("Failed to generate Ollama URL: {}", e)))?;

        let agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(DEFAULT_TIMEOUT_SECONDS)))
            .build()
            .into();

        Ok(Self {
            base_url,
            model: config.model.clone(),
            batch_size: config.batch_size.max(1),
            dims: config.embedding_dimension,
            agent,
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
        })
    }

    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.agent = ureq::Agent::config_builder()
            .timeout_global(Some(timeout))
            .build()
            .into();
        self
    }

    #[inline]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Check the server answers and has the configured model.
    #[inline]
    pub fn health_check(&self) -> Result<()> {
        debug!("Performing health check for Ollama at {}", self.base_url);
        self.validate_model()?;
        info!(
            "Health check passed for Ollama server at {} with model {}",
            self.base_url, self.model
        );
        Ok(())
    }

    #[inline]
    pub fn validate_model(&self) -> Result<()> {
        let models = self.list_models()?;

        if models.iter().any(|m| m.name == self.model) {
            debug!("Model {} is available", self.model);
            return Ok(());
        }

        let available: Vec<&str> = models.iter().map(|m| m.name.as_str()).collect();
        warn!(
            "Model {} not found. Available models: {:?}",
            self.model, available
        );
        Err(IndexError::Config(format!(
            "Model '{}' is not available. Available models: {:?}",
            self.model, available
        )))
    }

    #[inline]
    pub fn list_models(&self) -> Result<Vec<ModelInfo>> {
        let url = self.endpoint("/api/tags")?;
        let response_text = self.request(|| {
            self.agent
                .get(url.as_str())
                .call()
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let models: ModelsResponse = serde_json::from_str(&response_text).map_err(|e| {
            IndexError::Embedding(format!("Failed to parse models response: {}", e))
        })?;
        debug!("Found {} models", models.models.len());
        Ok(models.models)
    }

    /// Embed `texts`, sending at most `batch_size` inputs per request.
    pub fn generate_embeddings_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut vectors = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size as usize) {
            vectors.extend(self.embed_chunk(chunk)?);
        }

        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims as usize) {
            return Err(IndexError::Embedding(format!(
                "Model {} returned {} dimensions, expected {}",
                self.model,
                bad.len(),
                self.dims
            )));
        }

        debug!("Generated {} embeddings", vectors.len());
        Ok(vectors)
    }

    fn embed_chunk(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let url = self.endpoint("/api/embed")?;
        let request_json = serde_json::to_string(&BatchEmbedRequest {
            model: &self.model,
            inputs: texts,
        })?;

        let response_text = self.request(|| {
            self.agent
                .post(url.as_str())
                .header("Content-Type", "application/json")
                .send(&request_json)
                .and_then(|mut resp| resp.body_mut().read_to_string())
        })?;

        let response: BatchEmbedResponse = serde_json::from_str(&response_text).map_err(|e| {
            IndexError::Embedding(format!("Failed to parse embedding response: {}", e))
        })?;

        if response.embeddings.len() != texts.len() {
            return Err(IndexError::Embedding(format!(
                "Mismatch between request and response counts: {} vs {}",
                texts.len(),
                response.embeddings.len()
            )));
        }
        Ok(response.embeddings)
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| IndexError::Config(format!("Failed to build Ollama URL: {}", e)))
    }

    fn request<F>(&self, request_fn: F) -> Result<String>
    where
        F: FnMut() -> std::result::Result<String, ureq::Error>,
    {
        send_with_retry(self.base_url.as_str(), self.retry_attempts, request_fn)
            .map_err(|e| IndexError::Network(format!("Ollama request failed: {}", e)))
    }
}

#[async_trait]
impl EmbeddingModel for OllamaClient {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn embedding_dims(&self) -> u32 {
        self.dims
    }

    async fn embedding(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let client = self.clone();
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || client.generate_embeddings_batch(&texts))
            .await
            .map_err(|e| IndexError::Embedding(format!("Embedding task failed: {}", e)))?
    }
}
