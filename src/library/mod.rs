// Library module
// One named collection of blocks for an account: its text index, its card and the
// context its vector engines are opened with.

#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::Config;
use crate::text_index::schema::safe_name;
use crate::text_index::{
    self, Block, CollectionRetrieval, CollectionWriter, EmbeddingRecord, LibraryCard, TextIndex,
};
use crate::vector_store::EngineContext;
use crate::{IndexError, Result};

pub struct Library {
    library_name: String,
    account_name: String,
    index: Arc<dyn TextIndex>,
    config: Config,
}

impl Library {
    /// Create the library's text index and its card. Creating an existing library
    /// attaches to it and leaves its card alone.
    pub async fn create(config: &Config, library_name: &str) -> Result<Self> {
        let library = Self::attach(config, library_name).await?;
        library.writer().build_text_index().await?;

        if library.index.get_library_card().await?.is_none() {
            let card = LibraryCard::new(&library.library_name, &library.account_name);
            library.writer().save_library_card(&card).await?;
            info!(
                "Created library {} for account {}",
                library.library_name, library.account_name
            );
        }
        Ok(library)
    }

    /// Open a library that was created earlier.
    pub async fn open(config: &Config, library_name: &str) -> Result<Self> {
        let library = Self::attach(config, library_name).await?;
        if library.index.get_library_card().await?.is_none() {
            return Err(IndexError::Config(format!(
                "Library {} does not exist for account {}",
                library.library_name, library.account_name
            )));
        }
        Ok(library)
    }

    async fn attach(config: &Config, library_name: &str) -> Result<Self> {
        let library_name = safe_name(library_name)?;
        std::fs::create_dir_all(config.text_index_dir())?;
        let index = text_index::open(
            &config.text_index,
            &config.text_index_dir(),
            &config.account_name,
            &library_name,
        )
        .await?;
        Ok(Self::with_index(config, index))
    }

    /// Wrap an already opened text index.
    #[inline]
    pub fn with_index(config: &Config, index: Arc<dyn TextIndex>) -> Self {
        Self {
            library_name: index.collection_name().to_string(),
            account_name: index.account_name().to_string(),
            index,
            config: config.clone(),
        }
    }

    #[inline]
    pub fn library_name(&self) -> &str {
        &self.library_name
    }

    #[inline]
    pub fn account_name(&self) -> &str {
        &self.account_name
    }

    #[inline]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[inline]
    pub fn index(&self) -> Arc<dyn TextIndex> {
        Arc::clone(&self.index)
    }

    #[inline]
    pub fn retrieval(&self) -> CollectionRetrieval {
        CollectionRetrieval::new(self.index())
    }

    #[inline]
    pub fn writer(&self) -> CollectionWriter {
        CollectionWriter::new(self.index())
    }

    pub async fn get_library_card(&self) -> Result<LibraryCard> {
        self.index.get_library_card().await?.ok_or_else(|| {
            IndexError::TextIndex(format!("No library card for {}", self.library_name))
        })
    }

    /// Merge one ledger entry into the card, or remove it when `delete` is set.
    pub async fn update_embedding_status(
        &self,
        record: EmbeddingRecord,
        delete: bool,
    ) -> Result<LibraryCard> {
        debug!(
            "Updating ledger of {}: {}/{} delete={}",
            self.library_name, record.embedding_db, record.embedding_model, delete
        );
        self.writer().update_library_card(record, delete).await
    }

    /// Recount documents, blocks, images, tables and pages into the card.
    pub async fn refresh_counts(&self) -> Result<LibraryCard> {
        let mut cursor = self.retrieval().get_whole_collection().await?;
        let mut blocks = 0u64;
        let mut images = 0u64;
        let mut tables = 0u64;
        let mut documents = HashSet::new();
        let mut pages = HashSet::new();

        while let Some(block) = cursor.pull_one().await? {
            blocks += 1;
            match block.get_str("content_type") {
                Some("image") => images += 1,
                Some("table") => tables += 1,
                _ => {}
            }
            if let Some(doc_id) = block.doc_id() {
                documents.insert(doc_id);
                if let Some(page) = block.get_i64("page_num") {
                    pages.insert((doc_id, page));
                }
            }
        }

        let mut card = self.get_library_card().await?;
        card.blocks = blocks;
        card.documents = documents.len() as u64;
        card.images = images;
        card.tables = tables;
        card.pages = pages.len() as u64;
        self.writer().update_card_counts(&card).await?;
        Ok(card)
    }

    /// Import parsed blocks. Each distinct source document, identified by its
    /// incoming `doc_ID` or else its `file_source`, gets one fresh library `doc_ID`.
    pub async fn add_blocks(&self, blocks: Vec<Block>) -> Result<Vec<String>> {
        let writer = self.writer();
        let mut assigned: HashMap<String, i64> = HashMap::new();
        let mut ids = Vec::with_capacity(blocks.len());

        for mut block in blocks {
            let source = match (block.doc_id(), block.get_str("file_source")) {
                (Some(doc_id), _) => Some(format!("doc:{}", doc_id)),
                (None, Some(file)) if !file.is_empty() => Some(format!("file:{}", file)),
                _ => None,
            };

            let doc_id = match source {
                Some(source) => match assigned.get(&source) {
                    Some(doc_id) => *doc_id,
                    None => {
                        let doc_id = writer.get_and_increment_doc_id().await?;
                        assigned.insert(source, doc_id);
                        doc_id
                    }
                },
                None => writer.get_and_increment_doc_id().await?,
            };

            block.set("doc_ID", doc_id);
            ids.push(writer.write_new_parsing_record(&block).await?);
        }

        info!(
            "Imported {} blocks from {} documents into {}",
            ids.len(),
            assigned.len(),
            self.library_name
        );
        self.refresh_counts().await?;
        Ok(ids)
    }

    /// Context for opening a vector engine on this library.
    #[inline]
    pub fn engine_context(&self, model_name: &str, dims: u32) -> EngineContext {
        let mut config = self.config.clone();
        config.account_name = self.account_name.clone();
        EngineContext::from_config(&config, &self.library_name, model_name, dims)
    }

    /// Remove every block and the card. Vector indexes must be deleted first.
    pub async fn delete(self) -> Result<()> {
        self.writer().delete_collection().await?;
        info!("Deleted library {}", self.library_name);
        Ok(())
    }
}
