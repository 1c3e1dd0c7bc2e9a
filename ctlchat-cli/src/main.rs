mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use ctlchat_core::chat::{InMemoryConversationStore, QueryOptions, RagEngine};
use ctlchat_core::config::{Config, StorageMode};
use ctlchat_core::provider;
use ctlchat_core::rag::{embedder_from_config, DocumentLoader, IndexStore, Ingestor};
use ctlchat_core::server::Server;
use futures::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "ctlchat")]
#[command(about = "Document-grounded chatbot: ingest files, ask questions, run the server", long_about = None)]
#[command(version)]
struct Cli {
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Configuration commands")]
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    #[command(about = "Load, chunk and index a directory of documents")]
    Ingest {
        #[arg(short, long, help = "Directory to ingest (defaults to rag.data_dir)")]
        dir: Option<PathBuf>,

        #[arg(long, help = "Split markdown files on the section separator")]
        markdown: bool,

        #[arg(long, help = "Clear the index first")]
        reset: bool,
    },

    #[command(about = "Answer a question from the indexed documents")]
    Ask {
        query: String,

        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        #[arg(long, help = "Rewrite the query with the LLM before searching (default: query.enhance)")]
        enhance: bool,

        #[arg(long, help = "Print the answer as it is generated")]
        stream: bool,
    },

    #[command(about = "Show index statistics")]
    Stats,

    #[command(about = "List indexed sources")]
    Sources,

    #[command(about = "Remove every chunk of a source")]
    Remove { source: String },

    #[command(about = "Delete all indexed documents")]
    Reset,

    #[command(about = "Run the Unix socket server")]
    Serve,
}

#[derive(Subcommand)]
enum ConfigCommands {
    #[command(about = "Show current configuration")]
    Show,

    #[command(about = "Set the LLM model")]
    SetModel {
        #[arg(help = "Model name (e.g., 'claude-haiku-4-5-20251001' or 'llama3.2')")]
        model: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Config { command } = &cli.command {
        return match command {
            ConfigCommands::Show => show_config(&load_config(&cli.config)?),
            ConfigCommands::SetModel { model } => set_model(&cli.config, model),
        };
    }

    let config = load_config(&cli.config)?;
    let _guard = logging::init(&config.logging);

    match cli.command {
        Commands::Config { .. } => Ok(()),
        Commands::Ingest { dir, markdown, reset } => ingest(&config, dir, markdown, reset).await,
        Commands::Ask {
            query,
            top_k,
            enhance,
            stream,
        } => ask(&config, &query, top_k, enhance, stream).await,
        Commands::Stats => stats(&config).await,
        Commands::Sources => sources(&config).await,
        Commands::Remove { source } => remove(&config, &source).await,
        Commands::Reset => reset(&config).await,
        Commands::Serve => serve(config).await,
    }
}

fn load_config(path: &Path) -> Result<Config> {
    let config = if path.exists() {
        Config::load(path).context("Failed to load config")?
    } else {
        Config::load_or_default().context("Failed to load config")?
    };
    Ok(config)
}

async fn open_index(config: &Config) -> Result<Arc<IndexStore>> {
    let index = IndexStore::open(config, embedder_from_config(config))
        .await
        .context("Failed to open vector index")?;
    Ok(Arc::new(index))
}

fn show_config(config: &Config) -> Result<()> {
    println!("{}", "Current Configuration:".bold().green());
    println!();
    println!("{}", "LLM:".bold());
    println!("  Provider:       {:?}", config.llm.provider);
    println!("  Model:          {}", config.llm.model.cyan());
    println!("  Base URL:       {}", config.llm.base_url);
    println!("  Max Tokens:     {}", config.llm.max_tokens);
    println!("  Temperature:    {}", config.llm.temperature);
    println!(
        "  API Key:        {}",
        if config.llm.api_key.is_some() { "set".green() } else { "missing".red() }
    );
    println!();
    println!("{}", "RAG:".bold());
    println!("  Embedding Model: {}", config.rag.embedding.model.cyan());
    println!("  Dimension:       {}", config.rag.embedding.dimension);
    println!("  Chunk Size:      {}", config.rag.chunk_size);
    println!("  Chunk Overlap:   {}", config.rag.chunk_overlap);
    println!("  Top K:           {}", config.rag.top_k);
    println!("  Data Dir:        {}", config.rag.data_dir.display());
    println!();
    println!("{}", "Storage:".bold());
    match &config.storage.storage_mode {
        StorageMode::Embedded { path } => println!("  Vector DB:       LanceDB at {}", path),
        StorageMode::Grpc { url } => println!("  Vector DB:       Qdrant at {}", url),
        StorageMode::Memory => println!("  Vector DB:       in-memory"),
    }
    println!("  Collection:      {}", config.storage.vector_db.collection_name);
    println!();
    println!("{}", "Server:".bold());
    println!("  Socket:          {}", config.server.socket_path);

    Ok(())
}

fn set_model(config_path: &Path, model: &str) -> Result<()> {
    let content = std::fs::read_to_string(config_path).context("Failed to read config file")?;

    let mut config: serde_yaml::Value = serde_yaml::from_str(&content).context("Failed to parse config")?;

    let llm = config
        .get_mut("llm")
        .and_then(|llm| llm.as_mapping_mut())
        .context("Config has no llm section")?;
    llm.insert(
        serde_yaml::Value::String("model".to_string()),
        serde_yaml::Value::String(model.to_string()),
    );

    let updated_content = serde_yaml::to_string(&config).context("Failed to serialize config")?;
    std::fs::write(config_path, updated_content).context("Failed to write config file")?;

    println!("{} Model updated to: {}", "✓".green().bold(), model.cyan());
    Ok(())
}

async fn ingest(config: &Config, dir: Option<PathBuf>, markdown: bool, reset: bool) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let dir = dir.unwrap_or_else(|| config.rag.data_dir.clone());
    let index = open_index(config).await?;
    let ingestor = Ingestor::new(index, DocumentLoader::new(&config.rag));

    println!("{} Ingesting {}...", "→".blue(), dir.display());
    let report = ingestor
        .ingest_directory(&dir, markdown, reset)
        .await
        .context("Ingestion failed")?;

    println!(
        "{} Indexed {} chunks from {} files ({} total in index)",
        "✓".green().bold(),
        report.chunks_added.to_string().cyan(),
        report.files_loaded,
        report.total_count
    );
    for (path, reason) in &report.skipped {
        println!("  {} skipped {}: {}", "!".yellow(), path.display(), reason);
    }
    Ok(())
}

async fn ask(config: &Config, query: &str, top_k: Option<usize>, enhance: bool, stream: bool) -> Result<()> {
    config.validate().context("Invalid configuration")?;
    let provider = provider::from_config(&config.llm)?;
    let index = open_index(config).await?;
    let engine = RagEngine::new(config, provider, index, Arc::new(InMemoryConversationStore::new()))?;

    let options = ask_options(top_k, enhance);

    let sources = if stream {
        let answer = engine.query_stream(query, &options).await?;
        let mut fragments = answer.stream;
        let mut stdout = std::io::stdout();
        while let Some(fragment) = fragments.next().await {
            print!("{}", fragment?);
            stdout.flush()?;
        }
        println!();
        answer.sources
    } else {
        let answer = engine.query(query, &options).await?;
        if let Some(enhancement) = &answer.enhancement {
            println!(
                "{} {} ({})",
                "Search:".dimmed(),
                enhancement.enhanced_query.dimmed(),
                enhancement.intent_type
            );
        }
        println!("{}", answer.response);
        answer.sources
    };

    if !sources.is_empty() {
        println!();
        println!("{}", "Sources:".bold());
        for (i, source) in sources.iter().enumerate() {
            println!("  {} {} ({:.3})", format!("[{}]", i + 1).cyan(), source.source, source.distance);
        }
    }
    Ok(())
}

/// `--enhance` can only force rewriting on; without it `query.enhance` decides.
fn ask_options(top_k: Option<usize>, enhance: bool) -> QueryOptions {
    QueryOptions {
        top_k,
        enhance: enhance.then_some(true),
        ..QueryOptions::default()
    }
}

async fn stats(config: &Config) -> Result<()> {
    let index = open_index(config).await?;
    println!("{}", "Index:".bold().green());
    println!("  Documents:       {}", index.count().await.to_string().cyan());
    println!("  Collection:      {}", config.storage.vector_db.collection_name);
    println!("  Embedding Model: {}", config.rag.embedding.model);
    Ok(())
}

async fn sources(config: &Config) -> Result<()> {
    let index = open_index(config).await?;
    let sources = index.sources().await?;
    if sources.is_empty() {
        println!("{}", "No documents indexed. Run 'ctlchat ingest' first.".yellow());
        return Ok(());
    }
    for source in sources {
        println!("  {} {}", "•".cyan(), source);
    }
    Ok(())
}

async fn remove(config: &Config, source: &str) -> Result<()> {
    let index = open_index(config).await?;
    let removed = index.remove_source(source).await?;
    println!("{} Removed {} chunks of {}", "✓".green().bold(), removed, source.cyan());
    Ok(())
}

async fn reset(config: &Config) -> Result<()> {
    let index = open_index(config).await?;
    index.reset().await.context("Failed to reset index")?;
    println!("{} Index reset", "✓".green().bold());
    Ok(())
}

async fn serve(config: Config) -> Result<()> {
    let server = Server::from_config(config).await.context("Failed to start server")?;
    server.start().await?;
    Ok(())
}
