//! Binary entry point: loads configuration, wires up tracing, and serves
//! the gateway router.

use std::path::PathBuf;

use clap::Parser;
use registry_gateway::config::GatewayConfig;
use registry_gateway::state::GatewayState;

#[derive(Parser, Debug)]
#[command(name = "registry-gateway", about = "Multi-protocol artifact registry reverse proxy")]
struct Args {
    /// Path to the gateway's YAML configuration file.
    #[arg(long, env = "GATEWAY_CONFIG", default_value = "gateway.yaml")]
    config: PathBuf,
}

fn init_tracing(format: &str, filter: &str) {
    let env_filter =
        tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(env_filter);
    if format == "json" {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let raw_yaml = std::fs::read_to_string(&args.config)
        .map_err(|e| anyhow::anyhow!("reading config {}: {e}", args.config.display()))?;
    let config = GatewayConfig::from_yaml(&raw_yaml)
        .map_err(|e| anyhow::anyhow!("parsing config {}: {e}", args.config.display()))?;

    init_tracing(&config.logging.format, &config.logging.filter);

    let bind = config.bind.clone();
    let state = GatewayState::new(config);
    state.spawn_sweepers();

    let router = registry_gateway::build_router(state);

    tracing::info!(bind = %bind, "starting registry-gateway");
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    axum::serve(listener, router).await?;
    Ok(())
}
