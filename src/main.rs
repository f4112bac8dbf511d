use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use finrag_core::agent::FinancialAgent;
use finrag_core::config::AppConfig;
use finrag_core::embed::{Embedder, EmbeddingProvider};
use finrag_core::error::FinRagError;
use finrag_core::retrieval::{self, RetrievalEngine, RetrievalSettings, TopicSource};
use finrag_core::sandbox::CodeExecutor;
use finrag_core::AgentSettings;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "finrag", about = "Financial knowledge-base assistant")]
struct Cli {
    /// Root directory for collections (overrides FINRAG_DATA_DIR)
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Collection name (overrides FINRAG_COLLECTION)
    #[arg(long, global = true)]
    collection: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the vector index from the configured corpus sources
    Ingest {
        /// Drop the existing collection and index from scratch
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    /// Ask the assistant a question
    Ask {
        message: String,
        /// Restrict retrieval to one topic ("All" for no filter)
        #[arg(long)]
        topic: Option<String>,
    },
    /// List the topics available for filtering
    Topics {
        /// List the topics present in the index instead of the fixed taxonomy
        #[arg(long, default_value_t = false)]
        indexed: bool,
    },
    /// Run a snippet in the calculation sandbox
    Exec { code: String },
}

#[tokio::main]
async fn main() -> Result<(), FinRagError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::from_env()?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = dir;
    }
    if let Some(name) = cli.collection {
        config.collection_name = name;
    }
    config.validate()?;

    match cli.command {
        Command::Ingest { force } => ingest(&config, force).await,
        Command::Ask { message, topic } => {
            let agent = FinancialAgent::from_config(&config).await?;
            println!("{}", agent.answer(&message, topic.as_deref()).await);
            agent.engine().close().await
        }
        Command::Topics { indexed: false } => {
            for topic in retrieval::static_topics() {
                println!("{}", topic);
            }
            Ok(())
        }
        Command::Topics { indexed: true } => {
            let engine = open_engine(&config)?;
            for topic in engine.topics(TopicSource::Indexed).await {
                println!("{}", topic);
            }
            engine.close().await
        }
        Command::Exec { code } => {
            let executor = CodeExecutor::new(AgentSettings::from(&config).sandbox);
            println!("{}", executor.execute(&code));
            Ok(())
        }
    }
}

fn open_engine(config: &AppConfig) -> Result<RetrievalEngine, FinRagError> {
    let embedder: Arc<dyn EmbeddingProvider> = Arc::new(Embedder::new(&config.embedding_model)?);
    RetrievalEngine::open(RetrievalSettings::from(config), embedder)
}

async fn ingest(config: &AppConfig, force: bool) -> Result<(), FinRagError> {
    let mut engine = open_engine(config)?;
    if force {
        engine.destroy().await?;
        engine = open_engine(config)?;
    }

    let existing = engine.count().await?;
    if existing > 0 {
        println!(
            "Collection {} already holds {} documents; use --force to rebuild.",
            engine.collection_dir().display(),
            existing
        );
        return engine.close().await;
    }

    let report = engine.ingest_from_sources().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    println!("{}", serde_json::to_string_pretty(&engine.stats().await?)?);
    engine.close().await
}
