//! Web server module.

mod handlers;

pub use handlers::*;

use crate::config::ServerConfig;
use crate::db::Store;
use crate::geo::GeoLocator;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<Store>,
    pub geo: Arc<GeoLocator>,
}

/// Web server for FleetHub.
pub struct Server {
    state: AppState,
}

impl Server {
    /// Create a new server with the given dependencies.
    pub fn new(config: ServerConfig, store: Arc<Store>, geo: Arc<GeoLocator>) -> Self {
        Self {
            state: AppState { config, store, geo },
        }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // Device-facing, API-key gated
            .route("/api/checkin", post(handlers::handle_checkin))
            // Administrative
            .route(
                "/api/commands",
                get(handlers::handle_list_commands).post(handlers::handle_create_command),
            )
            .route("/api/devices/register", post(handlers::handle_register_device))
            .route(
                "/api/devices/{id}",
                get(handlers::handle_get_device)
                    .put(handlers::handle_rename_device)
                    .delete(handlers::handle_delete_device),
            )
            // Dashboard-facing read
            .route("/api/fleet", get(handlers::handle_fleet))
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}
