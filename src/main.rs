//! FleetHub - Appliance Fleet Command & Control
//!
//! Devices phone home over HTTP; the server reconciles reported state and
//! delivers queued administrative commands in the check-in response.

mod config;
mod db;
mod fleet;
mod geo;
mod web;

use config::ServerConfig;
use db::Store;
use geo::GeoLocator;
use web::Server;

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("fleethub=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting FleetHub on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    let devices = store.get_devices()?;
    tracing::info!("Database initialized, {} device(s) known", devices.len());

    let geo = Arc::new(GeoLocator::new(cfg.geo_enabled));

    // Start web server
    let server = Server::new(cfg, store, geo);
    server.start().await?;

    Ok(())
}
