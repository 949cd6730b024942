use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndexError>;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unknown vector store engine: {0}")]
    UnknownEngine(String),

    #[error("An embedding model name is required")]
    MissingModel,

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Text index error: {0}")]
    TextIndex(String),

    #[error("Vector store error: {0}")]
    VectorStore(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl IndexError {
    /// Configuration errors are reported immediately and never retried.
    #[inline]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::UnknownEngine(_) | Self::MissingModel | Self::InvalidName(_)
        )
    }
}

pub mod commands;
pub mod config;
pub mod custom_table;
pub mod embedding;
pub mod library;
pub mod text_index;
pub mod vector_store;

#[cfg(test)]
pub(crate) mod test_support;
