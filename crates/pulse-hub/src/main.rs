use anyhow::Context;
use pulse_hub::config::load_config;
use pulse_hub::logging::init_logging;
use pulse_hub::run_hub;
use pulse_reader::SessionDirReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let (config, warnings) = load_config();
    let _log_guard = init_logging(config.debug, &config.log_dir, &config.addr());
    for warning in warnings {
        warn!(event = "config_fallback", detail = %warning);
    }

    if let Err(err) = run(config).await {
        error!(event = "hub_error", error = %format!("{err:#}"));
        std::process::exit(1);
    }
}

async fn run(config: pulse_hub::config::Config) -> anyhow::Result<()> {
    let addr: SocketAddr = config
        .addr()
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr()))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "shutdown_signal");
        let _ = shutdown_tx.send(true);
    });

    let source = Arc::new(SessionDirReader::new(config.sessions_dir.clone()));
    run_hub(config, listener, source, shutdown_rx).await
}
