//! Log Server Application
//!
//! Accepts entries from producers and fans them out to connected viewers.
//!
//! Usage: `log-server [--config PATH]`

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_log_viewer::{config::AppConfig, server::WebServer};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Live Log Server");

    let mut config_path: Option<PathBuf> = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                config_path = Some(args.next().context("--config needs a path")?.into());
            }
            other => anyhow::bail!("Unknown argument '{}'", other),
        }
    }

    let config = AppConfig::load(config_path.as_deref()).context("Failed to load config")?;
    if config.server.token.is_some() {
        tracing::info!("Viewer and producer token required");
    }

    let web_server = WebServer::new(config.server.clone());
    web_server
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down...");
        })
        .await?;

    Ok(())
}
