//! # courier
//!
//! Courier server binary: loads settings, starts telemetry and serves the
//! demo `chat` connection type over WebSockets.

#![deny(unsafe_code)]

mod chat;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use courier_server::settings::load_settings;
use courier_server::{CourierServer, Services};
use courier_telemetry::init_telemetry;
use tracing::info;

/// Courier event routing server.
#[derive(Parser, Debug)]
#[command(name = "courier", version, about = "Event envelope routing over WebSockets")]
struct Cli {
    /// JSON settings file, merged over the defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut settings = load_settings(cli.config.as_deref()).context("failed to load settings")?;
    if let Some(host) = cli.host {
        settings.server.host = host;
    }
    if let Some(port) = cli.port {
        settings.server.port = port;
    }

    let telemetry = init_telemetry(settings.telemetry.to_config()?)
        .context("failed to initialize telemetry")?;

    let consumer = chat::consumer(&settings.consumer);
    let services = Services::in_memory(settings.users.clone());
    info!(users = settings.users.len(), ?consumer, "starting courier");

    let server = CourierServer::new(settings.server, consumer, services)
        .with_prometheus(telemetry.prometheus());
    let (addr, handle) = server.listen().await?;
    info!(%addr, "courier ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl+c")?;

    info!("shutting down");
    server.graceful_shutdown(handle, None).await;
    Ok(())
}
