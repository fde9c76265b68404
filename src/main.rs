use clap::Parser;
use openai_shim::config::{config_search_paths, ShimConfig};
use openai_shim::{build_router, AppState, Engine, ExchangeLog, HttpBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(
    name = "openai-shim",
    about = "OpenAI-compatible API in front of a local model runtime",
    version
)]
struct Cli {
    /// Path to config file (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Address to bind (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// Base URL of the native runtime (overrides config)
    #[arg(long)]
    native_url: Option<String>,

    /// Append exchange records to this file as JSON lines (overrides config)
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Print config search paths and exit
    #[arg(long)]
    show_config_paths: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "openai_shim=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if cli.show_config_paths {
        println!("Config search paths:");
        for (i, path) in config_search_paths().iter().enumerate() {
            println!("  {}. {}", i + 1, path.display());
        }
        return Ok(());
    }

    let mut config = ShimConfig::find_and_load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(url) = cli.native_url {
        config.native.base_url = url;
    }
    if let Some(path) = cli.log_file {
        config.log_file = Some(path);
    }
    config.validate()?;

    let log = match config.log_file {
        Some(ref path) => ExchangeLog::with_file(path)?,
        None => ExchangeLog::in_memory(),
    };
    let backend = HttpBackend::new(&config.native)?;

    info!("openai-shim v{}", env!("CARGO_PKG_VERSION"));
    info!("  Native runtime:    {}", backend.base_url());
    info!("  Temperature scale: {}", config.translation.temperature_scale);
    info!("  Estimate usage:    {}", config.translation.estimate_usage);
    if let Some(ref path) = config.log_file {
        info!("  Exchange log:      {}", path.display());
    }

    let engine = Engine::new(Arc::new(backend), config.translation.clone(), log);
    let app = build_router(Arc::new(AppState::new(engine)));

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!("Listening on http://{}", bind_addr);
    info!("  OPENAI_BASE_URL=http://{}/v1", bind_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
