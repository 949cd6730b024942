// Configuration management module
// TOML settings for the text index, vector store engines and the embedding model client

pub mod settings;

#[cfg(test)]
mod tests;

use anyhow::Result;
use console::style;

pub use settings::{
    ChromaSettings, Config, ConfigError, EmbeddingConfig, HnswSettings, MilvusSettings,
    Neo4jSettings, OllamaConfig, PgVectorSettings, PineconeSettings, QdrantSettings,
    TextIndexBackend, TextIndexConfig, VectorStoreConfig, WeaviateSettings,
};

/// Get the configuration directory path
#[inline]
pub fn get_config_dir() -> Result<std::path::PathBuf, ConfigError> {
    Config::config_dir()
}

/// Render the effective configuration, hiding secrets
#[inline]
pub fn render_config(config: &Config) -> Vec<String> {
    let secret = |value: &Option<String>| {
        if value.as_deref().is_some_and(|v| !v.is_empty()) {
            "<set>"
        } else {
            "<unset>"
        }
    };
    let vs = &config.vector_store;

    vec![
        format!("Account: {}", config.account_name),
        format!("Text index backend: {}", config.text_index.backend),
        format!("Embedding batch size: {}", config.embedding.batch_size),
        format!(
            "Ollama: {}://{}:{} model={} dims={}",
            config.ollama.protocol,
            config.ollama.host,
            config.ollama.port,
            config.ollama.model,
            config.ollama.embedding_dimension
        ),
        format!("Default vector engine: {}", vs.default_engine),
        format!(
            "hnsw: M={} ef_construction={} ef_search={}",
            vs.hnsw.max_connections, vs.hnsw.ef_construction, vs.hnsw.ef_search
        ),
        format!("qdrant: {} api_key={}", vs.qdrant.url, secret(&vs.qdrant.api_key)),
        format!("milvus: {} token={}", vs.milvus.url, secret(&vs.milvus.token)),
        format!(
            "chroma: {} tenant={} database={}",
            vs.chroma.url, vs.chroma.tenant, vs.chroma.database
        ),
        format!(
            "pinecone: {} {}/{} namespace={} api_key={}",
            vs.pinecone.controller_url,
            vs.pinecone.cloud,
            vs.pinecone.region,
            vs.pinecone.namespace,
            secret(&vs.pinecone.api_key)
        ),
        format!(
            "neo4j: {} user={} database={}",
            vs.neo4j.url, vs.neo4j.user, vs.neo4j.database
        ),
        format!(
            "weaviate: {} api_key={}",
            vs.weaviate.url,
            secret(&vs.weaviate.api_key)
        ),
    ]
}

#[inline]
pub fn show_config(config: &Config) -> Result<()> {
    eprintln!("{}", style("Current Configuration").bold().cyan());
    eprintln!();

    for line in render_config(config) {
        eprintln!("  {}", line);
    }

    eprintln!();
    eprintln!(
        "Config file: {}",
        style(config.config_file_path().display()).dim()
    );

    Ok(())
}
