use std::sync::Arc;

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use valet_broker::{HttpBroker, ToolBroker, ToolFilter};
use valet_cache::Cache;
use valet_catalog::{
    CatalogTool, EmbeddingProvider, OpenAiEmbeddingProvider, StubEmbeddingProvider, ToolCatalog,
    VectorIndex,
};
use valet_core::{ChatPipeline, Config};
use valet_provider::{GoogleProvider, ModelProvider, OpenAiProvider, ProviderRegistry};
use valet_server::state::AppState;
use valet_store::{ConnectionRegistry, Store};

#[derive(Parser)]
#[command(name = "valet", version, about = "valet tool-orchestrating assistant server")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Start the HTTP API server")]
    Start {
        #[arg(long, default_value = "127.0.0.1", help = "Bind address")]
        bind: String,
        #[arg(long, default_value = "3000", help = "HTTP API server port")]
        port: u16,
    },
    #[command(about = "Pull an app's tools from the broker into the vector catalog")]
    Ingest {
        #[arg(help = "App name, e.g. GMAIL")]
        app: String,
    },
    #[command(about = "Deactivate sessions inactive for longer than the given number of days")]
    CleanupSessions {
        #[arg(long, default_value = "30")]
        days: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("info,valet_core=debug")
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Start { bind, port } => {
            let state = build_state(&config).await?;
            valet_server::serve(state, &format!("{bind}:{port}")).await
        }
        Commands::Ingest { app } => {
            let broker = build_broker(&config)?;
            let catalog = build_catalog(&config)?;
            let tools = broker
                .get_tools(ToolFilter::apps(vec![app.clone()]), "default")
                .await?;
            let descriptors: Vec<CatalogTool> = tools
                .into_iter()
                .map(|t| CatalogTool {
                    name: t.name,
                    description: t.description,
                })
                .collect();
            let ingested = catalog.ingest(&app, &descriptors).await?;
            println!("ingested {ingested} tools into namespace {app}");
            Ok(())
        }
        Commands::CleanupSessions { days } => {
            let store = Store::open_with_retry(&config.database_url).await?;
            let deactivated = store.deactivate_stale_sessions(days).await?;
            println!("deactivated {deactivated} stale sessions");
            Ok(())
        }
    }
}

async fn build_state(config: &Config) -> Result<AppState> {
    let store = Arc::new(Store::open_with_retry(&config.database_url).await?);
    let cache = Cache::new();
    let registry = ConnectionRegistry::new(store.clone());
    let broker = build_broker(config)?;
    let catalog = build_catalog(config)?;
    let models = build_models(config)?;

    let pipeline = Arc::new(ChatPipeline::new(
        config.clone(),
        store,
        cache.clone(),
        models,
        broker.clone(),
        catalog.clone(),
    ));

    Ok(AppState {
        pipeline,
        registry,
        broker,
        catalog,
        cache,
    })
}

fn build_broker(config: &Config) -> Result<Arc<dyn ToolBroker>> {
    let api_key = config
        .broker_api_key
        .clone()
        .ok_or_else(|| anyhow!("BROKER_API_KEY is not set"))?;
    Ok(Arc::new(HttpBroker::new(api_key, &config.broker_api_base)))
}

fn build_catalog(config: &Config) -> Result<ToolCatalog> {
    let index = VectorIndex::open(&config.vector_store_path)?;
    let embedder: Arc<dyn EmbeddingProvider> = match &config.openai_api_key {
        Some(key) => Arc::new(OpenAiEmbeddingProvider::new(key.clone())),
        None => {
            tracing::warn!("OPENAI_API_KEY not set, using stub embeddings");
            Arc::new(StubEmbeddingProvider::new(valet_catalog::EMBEDDING_DIMENSIONS))
        }
    };
    ToolCatalog::new(index, embedder)
}

fn build_models(config: &Config) -> Result<Arc<ModelProvider>> {
    let mut registry = ProviderRegistry::new();
    if let Some(key) = &config.openai_api_key {
        registry.register(
            "openai",
            Arc::new(OpenAiProvider::new(key.clone(), "https://api.openai.com/v1")),
        );
    }
    if let Some(key) = &config.google_api_key {
        registry.register(
            "google",
            Arc::new(GoogleProvider::new(
                key.clone(),
                "https://generativelanguage.googleapis.com/v1beta",
            )),
        );
    }
    if registry.ids().is_empty() {
        return Err(anyhow!(
            "no LLM providers configured; set OPENAI_API_KEY and/or GOOGLE_API_KEY"
        ));
    }
    Ok(Arc::new(ModelProvider::new(
        registry,
        &config.chat_model,
        &config.analysis_model,
    )))
}
