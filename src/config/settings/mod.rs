
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use url::Url;

use crate::embedding::ollama::DEFAULT_EMBEDDING_DIMENSION;
use crate::vector_store::ENGINE_NAMES;

pub const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default = "default_account_name")]
    pub account_name: String,
    #[serde(default)]
    pub text_index: TextIndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub ollama: OllamaConfig,
    #[serde(default)]
    pub vector_store: VectorStoreConfig,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

fn default_account_name() -> String {
    "default".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            account_name: default_account_name(),
            text_index: TextIndexConfig::default(),
            embedding: EmbeddingConfig::default(),
            ollama: OllamaConfig::default(),
            vector_store: VectorStoreConfig::default(),
            base_dir: PathBuf::new(),
        }
    }
}

/// Which text-index backend holds the block collections.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TextIndexBackend {
    #[default]
    Sqlite,
    Postgres,
    DocumentStore,
}

impl TextIndexBackend {
    #[inline]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::Postgres => "postgres",
            Self::DocumentStore => "document_store",
        }
    }

    /// Relational backends support ad hoc custom tables.
    #[inline]
    pub fn is_relational(self) -> bool {
        matches!(self, Self::Sqlite | Self::Postgres)
    }
}

impl fmt::Display for TextIndexBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TextIndexBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sqlite" => Ok(Self::Sqlite),
            "postgres" => Ok(Self::Postgres),
            "document_store" | "tantivy" => Ok(Self::DocumentStore),
            other => Err(ConfigError::UnknownBackend(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TextIndexConfig {
    pub backend: TextIndexBackend,
    pub postgres_url: String,
    /// Release a cursor's backend connection as soon as its stream is drained.
    pub close_cursor_on_exhaustion: bool,
}

impl Default for TextIndexConfig {
    fn default() -> Self {
        Self {
            backend: TextIndexBackend::Sqlite,
            postgres_url: String::new(),
            close_cursor_on_exhaustion: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub batch_size: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_EMBEDDING_BATCH_SIZE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OllamaConfig {
    pub protocol: String,
    pub host: String,
    pub port: u16,
    pub model: String,
    pub batch_size: u32,
    pub embedding_dimension: u32,
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            protocol: "http".to_string(),
            host: "localhost".to_string(),
            port: 11434,
            model: "nomic-embed-text:latest".to_string(),
            batch_size: 16,
            embedding_dimension: DEFAULT_EMBEDDING_DIMENSION,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VectorStoreConfig {
    pub default_engine: String,
    pub postgres: PgVectorSettings,
    pub hnsw: HnswSettings,
    pub qdrant: QdrantSettings,
    pub milvus: MilvusSettings,
    pub chroma: ChromaSettings,
    pub pinecone: PineconeSettings,
    pub neo4j: Neo4jSettings,
    pub weaviate: WeaviateSettings,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            default_engine: "lancedb".to_string(),
            postgres: PgVectorSettings::default(),
            hnsw: HnswSettings::default(),
            qdrant: QdrantSettings::default(),
            milvus: MilvusSettings::default(),
            chroma: ChromaSettings::default(),
            pinecone: PineconeSettings::default(),
            neo4j: Neo4jSettings::default(),
            weaviate: WeaviateSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PgVectorSettings {
    /// Falls back to `text_index.postgres_url` when empty.
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HnswSettings {
    pub max_connections: usize,
    pub ef_construction: usize,
    pub ef_search: usize,
}

impl Default for HnswSettings {
    fn default() -> Self {
        Self {
            max_connections: 16,
            ef_construction: 200,
            ef_search: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QdrantSettings {
    pub url: String,
    pub api_key: Option<String>,
}

impl Default for QdrantSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MilvusSettings {
    pub url: String,
    pub token: Option<String>,
}

impl Default for MilvusSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:19530".to_string(),
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ChromaSettings {
    pub url: String,
    pub tenant: String,
    pub database: String,
}

impl Default for ChromaSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8000".to_string(),
            tenant: "default_tenant".to_string(),
            database: "default_database".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PineconeSettings {
    pub api_key: Option<String>,
    pub controller_url: String,
    pub cloud: String,
    pub region: String,
    pub namespace: String,
    pub readiness_timeout_secs: u64,
}

impl Default for PineconeSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            controller_url: "https://api.pinecone.io".to_string(),
            cloud: "aws".to_string(),
            region: "us-east-1".to_string(),
            namespace: "default".to_string(),
            readiness_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Neo4jSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl Default for Neo4jSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:7474".to_string(),
            user: "neo4j".to_string(),
            password: String::new(),
            database: "neo4j".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WeaviateSettings {
    pub url: String,
    pub api_key: Option<String>,
}

impl Default for WeaviateSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            api_key: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration directory not found or could not be created")]
    DirectoryError,
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Invalid port: {0} (must be between 1 and 65535)")]
    InvalidPort(u16),
    #[error("Invalid protocol: {0} (must be 'http' or 'https')")]
    InvalidProtocol(String),
    #[error("Invalid model name: {0} (cannot be empty)")]
    InvalidModel(String),
    #[error("Invalid Ollama batch size: {0} (must be between 1 and 1000)")]
    InvalidOllamaBatchSize(u32),
    #[error("Invalid embedding batch size: {0} (must be between 1 and 10000)")]
    InvalidBatchSize(usize),
    #[error("Invalid embedding dimension: {0} (must be greater than zero)")]
    InvalidEmbeddingDimension(u32),
    #[error("Invalid account name: {0:?}")]
    InvalidAccountName(String),
    #[error("Unknown text index backend: {0}")]
    UnknownBackend(String),
    #[error("Unknown vector store engine: {0}")]
    UnknownEngine(String),
    #[error("The postgres text index backend requires text_index.postgres_url")]
    MissingPostgresUrl,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("TOML serialization error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
}

impl Config {
    #[inline]
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        dirs::home_dir()
            .map(|home| home.join(".corpus-index"))
            .or_else(|| dirs::data_dir().map(|data| data.join("corpus-index")))
            .ok_or(ConfigError::DirectoryError)
    }

    #[inline]
    pub fn load<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config_path = config_dir.as_ref().join("config.toml");

        if !config_path.exists() {
            return Ok(Self {
                base_dir: config_dir.as_ref().to_path_buf(),
                ..Self::default()
            });
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;
        config.base_dir = config_dir.as_ref().to_path_buf();

        config
            .validate()
            .with_context(|| "Configuration validation failed")?;

        Ok(config)
    }

    #[inline]
    pub fn save(&self) -> Result<()> {
        self.validate()
            .context("Configuration validation failed before saving")?;

        let config_dir = self.get_base_dir();

        fs::create_dir_all(config_dir).with_context(|| {
            format!(
                "Failed to create config directory: {}",
                config_dir.display()
            )
        })?;

        let config_path = self.config_file_path();
        let content = toml::to_string_pretty(self).context("Failed to serialize config to TOML")?;

        fs::write(&config_path, content)
            .with_context(|| format!("Failed to write config file: {}", config_path.display()))?;

        Ok(())
    }

    #[inline]
    pub fn get_base_dir(&self) -> &Path {
        &self.base_dir
    }

    #[inline]
    pub fn validate(&self) -> Result<(), ConfigError> {
        let account = self.account_name.trim();
        if account.is_empty()
            || !account
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(ConfigError::InvalidAccountName(self.account_name.clone()));
        }

        if self.text_index.backend == TextIndexBackend::Postgres
            && self.text_index.postgres_url.trim().is_empty()
        {
            return Err(ConfigError::MissingPostgresUrl);
        }

        if !(1..=10_000).contains(&self.embedding.batch_size) {
            return Err(ConfigError::InvalidBatchSize(self.embedding.batch_size));
        }

        if !ENGINE_NAMES.contains(&self.vector_store.default_engine.as_str()) {
            return Err(ConfigError::UnknownEngine(
                self.vector_store.default_engine.clone(),
            ));
        }

        self.ollama.validate()
    }

    #[inline]
    pub fn config_file_path(&self) -> PathBuf {
        self.get_base_dir().join("config.toml")
    }

    /// Root directory for on-disk text indexes (SQLite files, document-store indexes)
    #[inline]
    pub fn text_index_dir(&self) -> PathBuf {
        self.get_base_dir().join("text_index")
    }

    /// Root directory for local vector stores (LanceDB, SQLite vectors, HNSW files)
    #[inline]
    pub fn vector_dir(&self) -> PathBuf {
        self.get_base_dir().join("vectors")
    }

    /// SQLite file holding pollable embedding job progress
    #[inline]
    pub fn status_db_path(&self) -> PathBuf {
        self.get_base_dir().join("embedding_status.db")
    }

    #[inline]
    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        self.ollama.ollama_url()
    }

    /// Postgres URL for the pgvector engine, defaulting to the text index database.
    #[inline]
    pub fn pgvector_url(&self) -> &str {
        if self.vector_store.postgres.url.trim().is_empty() {
            &self.text_index.postgres_url
        } else {
            &self.vector_store.postgres.url
        }
    }
}

impl OllamaConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.protocol != "http" && self.protocol != "https" {
            return Err(ConfigError::InvalidProtocol(self.protocol.clone()));
        }

        if self.port == 0 {
            return Err(ConfigError::InvalidPort(self.port));
        }

        self.ollama_url()?;

        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidModel(self.model.clone()));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::InvalidOllamaBatchSize(self.batch_size));
        }

        if self.embedding_dimension == 0 {
            return Err(ConfigError::InvalidEmbeddingDimension(
                self.embedding_dimension,
            ));
        }

        Ok(())
    }

    pub fn ollama_url(&self) -> Result<Url, ConfigError> {
        let url_str = format!("{}://{}:{}", self.protocol, self.host, self.port);
        Url::parse(&url_str).map_err(|_| ConfigError::InvalidUrl(url_str))
    }
}
