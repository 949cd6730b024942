use anyhow::Result;
use clap::{Parser, Subcommand};
use corpus_index::commands;
use corpus_index::config::{Config, show_config};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "corpus-index")]
#[command(about = "Text and vector indexing for block libraries")]
#[command(version)]
struct Cli {
    /// Directory holding config.toml and local indexes (defaults to ~/.corpus-index)
    #[arg(long, global = true)]
    config_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration, or show the current one
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Create a library and its text index
    CreateLibrary {
        library: String,
    },
    /// Import parsed blocks from a JSON-lines file
    ImportBlocks {
        library: String,
        path: PathBuf,
    },
    /// Full-text query over a library
    Query {
        library: String,
        text: String,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Embed a library's blocks into a vector store
    Embed {
        library: String,
        /// Vector store engine (defaults to vector_store.default_engine)
        #[arg(long)]
        engine: Option<String>,
        /// Embedding model (defaults to ollama.model)
        #[arg(long)]
        model: Option<String>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Only embed these documents, re-embedding their blocks
        #[arg(long, value_delimiter = ',')]
        doc_ids: Vec<i64>,
    },
    /// Semantic search over an embedded library
    Search {
        library: String,
        text: String,
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        model: Option<String>,
        #[arg(short, long, default_value_t = 10)]
        k: usize,
    },
    /// Drop a vector index and clear its embedding flags
    DeleteEmbedding {
        library: String,
        #[arg(long)]
        engine: Option<String>,
        #[arg(long)]
        model: Option<String>,
    },
    /// Show a library's card and embedding jobs
    Status {
        library: String,
    },
    /// Load a CSV, JSON or JSON-lines file into a custom table
    LoadTable {
        library: String,
        table: String,
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config_dir = match cli.config_dir {
        Some(dir) => dir,
        None => Config::config_dir()?,
    };
    let config = Config::load(&config_dir)?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&config)?;
            } else {
                commands::init_config(&config)?;
            }
        }
        Commands::CreateLibrary { library } => {
            commands::create_library(&config, &library).await?;
        }
        Commands::ImportBlocks { library, path } => {
            commands::import_blocks(&config, &library, &path).await?;
        }
        Commands::Query {
            library,
            text,
            limit,
        } => {
            commands::query(&config, &library, &text, limit).await?;
        }
        Commands::Embed {
            library,
            engine,
            model,
            batch_size,
            doc_ids,
        } => {
            commands::embed(
                &config,
                &library,
                engine.as_deref(),
                model.as_deref(),
                batch_size,
                &doc_ids,
            )
            .await?;
        }
        Commands::Search {
            library,
            text,
            engine,
            model,
            k,
        } => {
            commands::search(
                &config,
                &library,
                &text,
                engine.as_deref(),
                model.as_deref(),
                k,
            )
            .await?;
        }
        Commands::DeleteEmbedding {
            library,
            engine,
            model,
        } => {
            commands::delete_embedding(&config, &library, engine.as_deref(), model.as_deref())
                .await?;
        }
        Commands::Status { library } => {
            commands::show_status(&config, &library).await?;
        }
        Commands::LoadTable {
            library,
            table,
            path,
        } => {
            commands::load_table(&config, &library, &table, &path).await?;
        }
    }

    Ok(())
}
