use serde::Deserialize;

use parley_protocol::{DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_LIVENESS_TIMEOUT_SECS};

/// Top-level application configuration.
/// Loaded from environment variables (`PARLEY__SECTION__KEY`) and `.env`.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// Database settings. Without it the server runs on the in-memory store.
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    /// JWT settings
    pub auth: AuthConfig,
    /// Real-time transport tuning
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to (default: 0.0.0.0)
    #[serde(default = "default_host")]
    pub host: String,
    /// HTTP API port (default: 8080)
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    /// Log level used when `RUST_LOG` is unset (default: info)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Max connections in pool
    #[serde(default = "default_max_db_connections")]
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Secret shared with the platform's token issuer (HS256)
    pub jwt_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RealtimeConfig {
    /// Seconds between heartbeat sweeps (default: 30)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Seconds of silence after which a connection is evicted (default: 300)
    #[serde(default = "default_liveness_timeout")]
    pub liveness_timeout_secs: u64,
    /// Frames buffered per connection before it counts as a slow consumer
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
    /// Ceiling on concurrently registered connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval(),
            liveness_timeout_secs: default_liveness_timeout(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_connections: default_max_connections(),
        }
    }
}

impl AppConfig {
    /// Load config from environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .prefix("PARLEY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        cfg.try_deserialize()
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_api_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_max_db_connections() -> u32 {
    10
}
fn default_heartbeat_interval() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}
fn default_liveness_timeout() -> u64 {
    DEFAULT_LIVENESS_TIMEOUT_SECS
}
fn default_outbound_queue_capacity() -> usize {
    256
}
fn default_max_connections() -> usize {
    10_000
}
