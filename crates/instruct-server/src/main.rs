use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use instruct_engine::BackendKind;
use instruct_server::{run_server, AppState, Config, ConfigError, ServerError};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "instruct-server", version, about = "Streaming instruct LLM service")]
struct Args {
    /// Path to the YAML config file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the engine (HFEngine, VLLMEngine, LlamaCppEngine, MockEngine)
    #[arg(short, long)]
    engine: Option<BackendKind>,

    /// Log filter, e.g. `debug` or `instruct_server=trace` (defaults to RUST_LOG, then info)
    #[arg(long, env = "INSTRUCT_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let args = Args::parse();
    init_tracing(args.log_level.as_deref());

    let mut config = Config::load(&args.config)?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(engine) = args.engine {
        config.engine = engine;
    }
    config.validate()?;

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .map_err(|e| ConfigError::Invalid(format!("server address: {e}")))?;
    tracing::info!(
        engine = %config.engine,
        model = %config.hf_model_name,
        max_concurrent_tasks = config.scheduler.max_concurrent_tasks,
        "starting server on {}",
        addr
    );

    run_server(AppState::from_config(config), addr).await
}

fn init_tracing(level: Option<&str>) {
    let filter = match level {
        Some(level) => EnvFilter::new(level),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
