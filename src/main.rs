use anyhow::{Context, Result};
use clap::Parser;
use plcbroker_api::{ApiState, Server, ServerConfig};
use plcbroker_core::config::{AppConfig, LogFormat, LoggingConfig};
use plcbroker_driver::{simulated::SimulatedFactory, DriverRegistry};
use plcbroker_pool::{install_prometheus, Broker};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// PLC Broker - shared, serialized access to industrial controllers over HTTP
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "PLCBROKER_CONFIG", default_value = "config/plcbroker.yaml")]
    config: PathBuf,

    /// Override bind address
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Validate the configuration and exit
    #[arg(long)]
    check: bool,
}

fn init_tracing(logging: &LoggingConfig) -> Result<()> {
    let level = logging.parse_level()?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{},tower_http=info", level)));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match logging.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    result.map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = AppConfig::from_config_builder(&args.config)
        .with_context(|| format!("Failed to load config file: {}", args.config.display()))?;
    config.validate().context("Invalid configuration")?;

    init_tracing(&config.logging)?;
    info!(config = %args.config.display(), devices = config.devices.len(), "Configuration loaded");

    if args.check {
        info!("Configuration is valid");
        return Ok(());
    }

    let mut server_config = ServerConfig::from_api_config(&config.api)?;
    if let Some(bind) = args.bind {
        server_config.bind_addr = bind;
    }

    let prometheus = match install_prometheus() {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "Prometheus exporter unavailable");
            None
        }
    };

    let mut drivers = DriverRegistry::new();
    drivers.register("simulated", Arc::new(SimulatedFactory::new()));

    let broker = Arc::new(Broker::new(config, &drivers)?);
    broker.start();

    let mut state = ApiState::new(Arc::clone(&broker));
    if let Some(handle) = prometheus {
        state = state.with_prometheus(handle);
    }

    info!(bind = %server_config.bind_addr, "Starting PLC broker");
    let result = Server::new(server_config, state)
        .run(plcbroker_api::shutdown_signal())
        .await;

    broker.shutdown().await;

    if let Err(e) = &result {
        error!(error = %e, "Server error");
    }
    result
}
