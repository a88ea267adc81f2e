//! # tether-server
//!
//! Serves the demo echo handlers over WebSocket.

#![deny(unsafe_code)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tether_core::logging::init_subscriber;
use tether_core::{Engine, MiddlewareRegistry};
use tether_server::TetherServer;
use tether_server::echo::demo_routes;
use tether_settings::{TetherSettings, load_settings, load_settings_from_path};

/// tether WebSocket server.
#[derive(Parser, Debug)]
#[command(name = "tether-server", about = "tether connection lifecycle server")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `$TETHER_SETTINGS` or `~/.tether/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,
}

impl Cli {
    fn load(&self) -> Result<TetherSettings> {
        let mut settings = match &self.settings {
            Some(path) => load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => load_settings().context("Failed to load settings")?,
        };
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = cli.load()?;
    init_subscriber(&settings.logging.level);

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install metrics recorder")?;

    let registry = MiddlewareRegistry::with_builtins();
    let engine = Engine::from_settings(&settings.connection, &registry)
        .context("Invalid middleware configuration")?;
    tracing::info!(
        middleware = ?settings.connection.middleware,
        available = ?registry.names(),
        "middleware pipeline ready"
    );

    let server = TetherServer::new(settings.server.clone(), engine, demo_routes())
        .with_metrics(prometheus);
    let (addr, handle) = server.listen().await.context("Failed to bind server")?;
    tracing::info!("tether listening on http://{addr}");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl-c")?;

    tracing::info!("Shutting down...");
    server.shutdown();
    let _ = handle.await;
    tracing::info!("Shutdown complete");
    Ok(())
}
