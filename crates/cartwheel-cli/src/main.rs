use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use cartwheel_agents::{GraphRuntime, MemoryCheckpointStore, Services};
use cartwheel_cache::{
    DetailCache, ListCacheBackend, MemoryListBackend, RemoteListBackend, SemanticListCache,
};
use cartwheel_core::config::{Config, data_dir, expand_path};
use cartwheel_core::error::CartwheelError;
use cartwheel_core::product_code::ProductCodec;
use cartwheel_core::stores::{MemoryChatStore, MemoryMessageStore, StaticTokenAuth, TokenAuth};
use cartwheel_gateway::{auth_from_config, start_gateway, GatedProvider, GatewayState, RateLimiter};
use cartwheel_providers::{
    Embedder, FailoverProvider, HashEmbedder, HttpEmbedder, LlmProvider, OpenAiCompatProvider,
};
use cartwheel_search::fetch::PageFetcher;
use cartwheel_search::sites::build_registry;
use cartwheel_search::{Reranker, SearchEngine, WebSearchClient};

#[derive(Parser)]
#[command(
    name = "cartwheel",
    about = "Conversational shopping assistant backend",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway server
    Serve {
        /// Port to listen on (default: 8321)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Show system status
    Status,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a specific config value
    Get { key: String },
    /// Set a config value
    Set { key: String, value: String },
}

const EXIT_CONFIG: u8 = 1;
const EXIT_FATAL: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(Config::config_path);
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: could not load {}: {e}", config_path.display());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    init_logging(&config, cli.verbose);

    let result = match cli.command {
        Commands::Serve { port } => serve(config, port).await,
        Commands::Config { action } => config_command(config, &config_path, action),
        Commands::Status => {
            status(&config, &config_path).await;
            Ok(())
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");
            ExitCode::from(exit_code_for(&err))
        }
    }
}

/// Config problems exit 1; anything else that stops the process is a fatal
/// dependency failure and exits 2.
fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<CartwheelError>() {
        Some(CartwheelError::Config(_)) => EXIT_CONFIG,
        _ => EXIT_FATAL,
    }
}

fn init_logging(config: &Config, verbose: bool) {
    let logging = config.logging.clone().unwrap_or_default();
    let base = if verbose {
        "debug".to_string()
    } else {
        logging.level.clone().unwrap_or_else(|| "info".into())
    };
    let mut filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(base));
    for directive in &logging.filters {
        match directive.parse() {
            Ok(parsed) => filter = filter.add_directive(parsed),
            Err(e) => eprintln!("warning: bad logging filter '{directive}': {e}"),
        }
    }

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match (logging.format.as_str(), logging.output.as_str()) {
        ("json", "stdout") => builder.json().init(),
        ("json", _) => builder.json().with_writer(std::io::stderr).init(),
        (_, "stdout") => builder.init(),
        _ => builder.with_writer(std::io::stderr).init(),
    }
}

async fn serve(config: Config, port_override: Option<u16>) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for warning in &warnings {
        warn!("{warning}");
    }
    if !errors.is_empty() {
        for problem in &errors {
            error!("{problem}");
        }
        return Err(CartwheelError::Config(format!(
            "{} config error(s), refusing to start",
            errors.len()
        ))
        .into());
    }

    let port = port_override.unwrap_or_else(|| config.gateway_port());
    let state = build_state(config).await?;
    info!("Starting Cartwheel gateway on port {port}");
    start_gateway(state, port).await
}

/// Assemble the gateway stack from configuration.
async fn build_state(config: Config) -> anyhow::Result<Arc<GatewayState>> {
    let search_config = config.search_config();
    let cache_config = config.cache_config();
    let provider_configs = config
        .models
        .as_ref()
        .and_then(|m| m.providers.clone())
        .unwrap_or_default();

    let limits = Arc::new(RateLimiter::from_config(&config.limits_config()));

    // The first provider is primary, the rest take over in order. Every
    // invocation passes the global LLM gate.
    let chain: Vec<Arc<dyn LlmProvider>> = provider_configs
        .iter()
        .map(|pc| Arc::new(OpenAiCompatProvider::from_config(pc)) as Arc<dyn LlmProvider>)
        .collect();
    let provider: Arc<dyn LlmProvider> = Arc::new(GatedProvider::new(
        Arc::new(FailoverProvider::new("models", chain)),
        limits.clone(),
    ));

    let embedder: Arc<dyn Embedder> = provider_configs
        .iter()
        .find(|pc| pc.embedding_model.is_some())
        .and_then(HttpEmbedder::from_config)
        .map(|e| Arc::new(e) as Arc<dyn Embedder>)
        .unwrap_or_else(|| Arc::new(HashEmbedder));

    let code_key = search_config.resolve_product_code_key().unwrap_or_else(|| {
        warn!("no search.product_code_key configured; product ids will not survive a restart");
        uuid::Uuid::new_v4().to_string()
    });
    let codec = Arc::new(ProductCodec::new(&code_key));

    let backend: Arc<dyn ListCacheBackend> = match cache_config.backend.as_str() {
        "remote" => Arc::new(RemoteListBackend::from_config(&cache_config)?),
        _ => Arc::new(MemoryListBackend::new(cache_config.max_entries)),
    };
    let list_cache = Arc::new(SemanticListCache::new(
        backend,
        embedder.clone(),
        &cache_config,
    ));

    let detail_dir = cache_config
        .detail_dir
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(|| data_dir().join("details"));
    let detail_cache = Arc::new(
        DetailCache::open(
            detail_dir,
            cache_config.detail_ttl(),
            cache_config.detail_max_entries,
        )
        .await?,
    );
    let _ = detail_cache.spawn_sweeper(Duration::from_secs(cache_config.sweep_interval_secs));

    let fetcher = Arc::new(PageFetcher::from_config(&search_config)?);
    let registry = build_registry(&search_config, fetcher, codec.clone(), Some(provider.clone()))?;

    let engine = Arc::new(SearchEngine::new(
        &search_config,
        registry,
        WebSearchClient::from_config(&search_config),
        list_cache,
        detail_cache,
        Reranker::new(embedder),
        codec,
    ));

    let runtime = GraphRuntime::new(
        Services {
            provider,
            engine: engine.clone(),
            websearch: WebSearchClient::from_config(&search_config).map(Arc::new),
        },
        Arc::new(MemoryCheckpointStore::new()),
    )
    .with_retry(search_config.retry.clone().unwrap_or_default());

    let auth: Arc<dyn TokenAuth> = match auth_from_config(&config)? {
        Some(auth) => auth,
        None => {
            let token = uuid::Uuid::new_v4().to_string();
            info!("no gateway auth configured; session token for this run: {token}");
            Arc::new(StaticTokenAuth::new(&token))
        }
    };

    Ok(Arc::new(GatewayState::new(
        Arc::new(config),
        auth,
        Arc::new(runtime),
        engine,
        limits,
        Arc::new(MemoryChatStore::default()),
        Arc::new(MemoryMessageStore::default()),
    )))
}

fn config_command(mut config: Config, path: &Path, action: ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            let json = serde_json::to_string_pretty(&config)?;
            println!("{json}");
        }
        ConfigAction::Get { key } => match config.get_path(&key) {
            Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
            None => {
                return Err(CartwheelError::Config(format!("no config value at '{key}'")).into());
            }
        },
        ConfigAction::Set { key, value } => {
            // Values parse as JSON where possible; anything else is a string.
            let parsed = serde_json::from_str(&value)
                .unwrap_or_else(|_| serde_json::Value::String(value.clone()));
            config.set_path(&key, parsed)?;
            config.save(path)?;
            println!("Set {key}");
        }
    }
    Ok(())
}

async fn status(config: &Config, path: &Path) {
    println!("Cartwheel v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", path.display());
    println!("Gateway port: {}", config.gateway_port());

    let health_url = format!("http://{}/health", config.bind_addr());
    let running = match reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
    {
        Ok(client) => client
            .get(&health_url)
            .send()
            .await
            .is_ok_and(|r| r.status().is_success()),
        Err(_) => false,
    };
    println!("Status: {}", if running { "running" } else { "not running" });
}
