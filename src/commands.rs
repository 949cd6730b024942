use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::custom_table::CustomTable;
use crate::embedding::{
    EmbeddingHandler, EmbeddingModel, EmbeddingStatusStore, OllamaClient, QueryVector, StatusSink,
};
use crate::library::Library;
use crate::text_index::Block;

const SNIPPET_LEN: usize = 120;

/// Forwards job progress to the status database and draws it as a progress bar.
struct ProgressStatus {
    store: EmbeddingStatusStore,
    bar: ProgressBar,
}

impl ProgressStatus {
    fn new(store: EmbeddingStatusStore) -> Self {
        let style = ProgressStyle::with_template("{bar:40} [{pos}/{len}] Embedding {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());
        Self {
            store,
            bar: ProgressBar::new(0).with_style(style),
        }
    }
}

#[async_trait]
impl StatusSink for ProgressStatus {
    async fn new_embedding_status(
        &self,
        library: &str,
        model: &str,
        total: u64,
    ) -> crate::Result<()> {
        self.bar.set_length(total);
        self.bar.set_position(0);
        self.bar.set_message(format!("{} with {}", library, model));
        self.store.new_embedding_status(library, model, total).await
    }

    async fn increment_embedding_status(
        &self,
        library: &str,
        model: &str,
        delta: u64,
    ) -> crate::Result<()> {
        self.bar.inc(delta);
        self.store
            .increment_embedding_status(library, model, delta)
            .await
    }
}

fn ollama_client(config: &Config, model: Option<&str>) -> Result<OllamaClient> {
    let mut settings = config.ollama.clone();
    if let Some(model) = model {
        settings.model = model.to_string();
    }
    let client = OllamaClient::new(&settings)?;
    client
        .validate_model()
        .with_context(|| format!("Embedding model {} is not available", settings.model))?;
    Ok(client)
}

fn snippet(block: &Block) -> String {
    let text = block.get_str("text").unwrap_or_default().replace('\n', " ");
    match text.char_indices().nth(SNIPPET_LEN) {
        Some((end, _)) => format!("{}...", &text[..end]),
        None => text,
    }
}

fn print_block(block: &Block, distance: Option<f32>) {
    let score = distance
        .map(|d| format!(" distance={:.4}", d))
        .unwrap_or_default();
    println!(
        "{} doc={} block={}{}",
        style(block.id()).cyan(),
        block.doc_id().unwrap_or_default(),
        block.block_id().unwrap_or_default(),
        style(score).dim()
    );
    println!("   {}", snippet(block));
}

/// Read one JSON object per line. Blank lines are skipped.
pub fn read_blocks(path: &Path) -> Result<Vec<Block>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(number, line)| {
            serde_json::from_str::<Map<String, Value>>(line)
                .map(Block::from_map)
                .with_context(|| format!("{}:{} is not a JSON object", path.display(), number + 1))
        })
        .collect()
}

pub async fn create_library(config: &Config, library_name: &str) -> Result<()> {
    let library = Library::create(config, library_name).await?;
    println!(
        "{} Library {} ready for account {}",
        style("✓").green(),
        style(library.library_name()).cyan(),
        library.account_name()
    );
    Ok(())
}

pub async fn import_blocks(config: &Config, library_name: &str, path: &Path) -> Result<()> {
    let library = Library::open(config, library_name).await?;
    let blocks = read_blocks(path)?;
    if blocks.is_empty() {
        warn!("No blocks found in {}", path.display());
        return Ok(());
    }

    let ids = library.add_blocks(blocks).await?;
    let card = library.get_library_card().await?;
    println!(
        "Imported {} blocks. {} now holds {} documents and {} blocks.",
        ids.len(),
        library.library_name(),
        card.documents,
        card.blocks
    );
    Ok(())
}

pub async fn query(config: &Config, library_name: &str, text: &str, limit: usize) -> Result<()> {
    let library = Library::open(config, library_name).await?;
    let results = library.retrieval().basic_query(text).await?;

    if results.is_empty() {
        println!("No blocks match \"{}\".", text);
        return Ok(());
    }
    println!("{} blocks match \"{}\":", results.len(), text);
    for block in results.iter().take(limit) {
        print_block(block, None);
    }
    Ok(())
}

pub async fn embed(
    config: &Config,
    library_name: &str,
    engine: Option<&str>,
    model: Option<&str>,
    batch_size: Option<usize>,
    doc_ids: &[i64],
) -> Result<()> {
    let engine = engine.unwrap_or(config.vector_store.default_engine.as_str());
    let batch_size = batch_size.unwrap_or(config.embedding.batch_size);
    let library = Library::open(config, library_name).await?;
    let client = ollama_client(config, model)?;

    let status = Arc::new(ProgressStatus::new(
        EmbeddingStatusStore::open(&config.status_db_path()).await?,
    ));
    let handler = EmbeddingHandler::new(library, status.clone());

    let doc_ids = (!doc_ids.is_empty()).then_some(doc_ids);
    let outcome = handler
        .create_new_embedding(engine, &client, doc_ids, batch_size)
        .await;
    status.bar.finish_and_clear();
    let summary = outcome?;

    println!(
        "{} {} embeddings created with {} into {}; {} blocks embedded in total ({} dims)",
        style("✓").green(),
        summary.embeddings_created,
        client.model_name(),
        engine,
        summary.embedded_blocks,
        summary.embedding_dims
    );
    Ok(())
}

pub async fn search(
    config: &Config,
    library_name: &str,
    text: &str,
    engine: Option<&str>,
    model: Option<&str>,
    k: usize,
) -> Result<()> {
    let engine = engine.unwrap_or(config.vector_store.default_engine.as_str());
    let library = Library::open(config, library_name).await?;
    let client = ollama_client(config, model)?;

    let vectors = client.embedding(&[text.to_string()]).await?;
    let handler = EmbeddingHandler::new(
        library,
        Arc::new(EmbeddingStatusStore::open(&config.status_db_path()).await?),
    );
    let results = handler
        .search_index(QueryVector::Batch(vectors), engine, client.model_name(), k)
        .await?;

    if results.is_empty() {
        println!("No embedded blocks found in {} for {}.", library_name, engine);
        return Ok(());
    }
    for (block, distance) in &results {
        print_block(block, Some(*distance));
    }
    Ok(())
}

pub async fn delete_embedding(
    config: &Config,
    library_name: &str,
    engine: Option<&str>,
    model: Option<&str>,
) -> Result<()> {
    let engine = engine.unwrap_or(config.vector_store.default_engine.as_str());
    let model = model.unwrap_or(config.ollama.model.as_str());
    let library = Library::open(config, library_name).await?;

    let card = library.get_library_card().await?;
    let dims = card
        .embedding_record(model, engine)
        .map(|record| record.embedding_dims)
        .unwrap_or(config.ollama.embedding_dimension);

    let handler = EmbeddingHandler::new(
        library,
        Arc::new(EmbeddingStatusStore::open(&config.status_db_path()).await?),
    );
    let unflagged = handler.delete_index(engine, model, dims).await?;
    println!(
        "{} Deleted {} embeddings of {} ({} blocks unflagged)",
        style("✓").green(),
        engine,
        model,
        unflagged
    );
    Ok(())
}

pub async fn show_status(config: &Config, library_name: &str) -> Result<()> {
    let library = Library::open(config, library_name).await?;
    let card = library.refresh_counts().await?;

    println!("{}", style(format!("Library {}", card.library_name)).bold().cyan());
    println!("  Account:   {}", card.account_name);
    println!("  Documents: {}", card.documents);
    println!("  Blocks:    {}", card.blocks);
    println!("  Pages:     {}", card.pages);
    println!("  Images:    {}", card.images);
    println!("  Tables:    {}", card.tables);
    println!();
    println!("{}", style("Embeddings:").bold().yellow());
    for record in &card.embedding {
        if record.is_placeholder() {
            println!("  none");
            continue;
        }
        println!(
            "  {} / {}: {} blocks, {} dims, {}",
            record.embedding_db,
            record.embedding_model,
            record.embedded_blocks,
            record.embedding_dims,
            record.time_stamp
        );
    }

    let jobs = EmbeddingStatusStore::open(&config.status_db_path())
        .await?
        .list(library.library_name())
        .await?;
    if !jobs.is_empty() {
        println!();
        println!("{}", style("Jobs:").bold().yellow());
        for job in jobs {
            let state = if job.is_complete() {
                style("complete").green()
            } else {
                style("in progress").yellow()
            };
            println!(
                "  {}: {}/{} {} (updated {})",
                job.embedding_model, job.processed, job.total, state, job.updated_at
            );
        }
    }
    Ok(())
}

pub async fn load_table(
    config: &Config,
    library_name: &str,
    table_name: &str,
    path: &Path,
) -> Result<()> {
    let library = Library::open(config, library_name).await?;
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let (table, rows) = match extension.as_str() {
        "csv" => CustomTable::load_csv(library.index(), table_name, path).await?,
        "json" | "jsonl" => CustomTable::load_json(library.index(), table_name, path).await?,
        other => bail!("Unsupported table file type: {:?} (expected csv, json or jsonl)", other),
    };

    info!("Loaded {} rows into {}", rows, table.name());
    println!(
        "{} Loaded {} rows into table {} ({} columns)",
        style("✓").green(),
        rows,
        style(table.name()).cyan(),
        table.columns().len()
    );
    Ok(())
}

/// Write the default configuration unless one exists, then print where it lives.
pub fn init_config(config: &Config) -> Result<()> {
    let path = config.config_file_path();
    if path.exists() {
        println!("Configuration already exists at {}", style(path.display()).cyan());
        return Ok(());
    }
    config.save()?;
    println!("Wrote default configuration to {}", style(path.display()).cyan());
    Ok(())
}
