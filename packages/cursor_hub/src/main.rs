use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::prelude::*;

use cursor_hub::config::{self, Args};
use cursor_hub::{Hub, build_router, load_tls_config, serve_plain, serve_tls};

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "cursor_hub=debug,tower_http=debug"
    } else {
        "cursor_hub=info,tower_http=info"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    let fmt_layer = if args.json_logs {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    if dotenv.is_err() {
        info!("No .env file found");
    }

    let config = config::resolve(&args)?;
    let hub = Hub::start(config.hub.clone())?;
    let router = build_router(hub);

    let listener = tokio::net::TcpListener::bind(config.addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.addr))?;
    let actual_addr = listener.local_addr()?;

    let shutdown_signal = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    match &config.tls {
        Some(paths) => {
            let tls = load_tls_config(paths)?;
            info!("Running with SSL on wss://{}", actual_addr);
            serve_tls(listener, router, tls, shutdown_signal).await?;
        }
        None => {
            info!("Running without SSL on ws://{}", actual_addr);
            serve_plain(listener, router, shutdown_signal).await?;
        }
    }

    info!("Shutdown complete");
    Ok(())
}
