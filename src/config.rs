//! Configuration module for FleetHub.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the API server (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "fleethub.db")
    pub db_path: String,
    /// Shared-secret API key devices present on check-in
    pub api_key: String,
    /// Whether to resolve caller IPs against the geolocation provider
    pub geo_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "fleethub.db".to_string(),
            api_key: "fleethub-dev-key".to_string(),
            geo_enabled: true,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `FLEETHUB_HTTP_PORT`: HTTP port (default: 8080)
    /// - `FLEETHUB_DB_PATH`: Database file path (default: "fleethub.db")
    /// - `FLEETHUB_API_KEY`: Device check-in API key
    /// - `FLEETHUB_GEO_ENABLED`: "false"/"0" disables geolocation lookups
    pub fn load() -> Self {
        let mut cfg = Self::default();

        if let Ok(port_str) = env::var("FLEETHUB_HTTP_PORT") {
            if let Ok(port) = port_str.parse() {
                cfg.http_port = port;
            }
        }

        if let Ok(db_path) = env::var("FLEETHUB_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Ok(api_key) = env::var("FLEETHUB_API_KEY") {
            if !api_key.is_empty() {
                cfg.api_key = api_key;
            }
        }

        if let Ok(geo) = env::var("FLEETHUB_GEO_ENABLED") {
            cfg.geo_enabled = !matches!(geo.to_lowercase().as_str(), "false" | "0" | "no");
        }

        cfg
    }
}
