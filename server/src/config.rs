//! Server configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::str::FromStr;

/// Server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// Database URL
    pub database_url: String,
    /// Maximum ciphertext size in bytes
    pub max_message_size: usize,
    /// WebSocket ping interval in seconds
    pub ws_ping_interval: u64,
    /// Seconds to wait for authentication before dropping connection
    pub auth_timeout_seconds: u64,
    /// Maximum total WebSocket connections (0 = unlimited)
    pub max_connections: usize,
    /// Maximum WebSocket connections per IP address (0 = unlimited)
    pub max_connections_per_ip: usize,
    /// Comma-separated list of allowed CORS origins (empty = permissive)
    pub cors_origins: Option<String>,
    /// Bearer token for /admin/* endpoints (None = endpoints hidden)
    pub admin_token: Option<String>,
    /// One-time pre-key count below which a bundle is reported unhealthy
    pub prekey_low_water_mark: u32,
    /// Maximum one-time pre-keys accepted in one upload
    pub max_one_time_prekeys: usize,
    /// Seconds between ephemeral destruction sweeps
    pub sweep_interval_seconds: u64,
    /// Seconds delivered queue entries are retained (default: 7 days)
    pub delivered_retention_seconds: i64,
    /// Lifetime of a device link code in seconds
    pub device_code_ttl_seconds: i64,
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let config = ServerConfig {
            host: lookup("SC_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_or(&lookup, "SC_PORT", "8443")?,
            database_url: lookup("SC_DATABASE_URL")
                .unwrap_or_else(|| "sqlite://./data/cipherpost.db".to_string()),
            max_message_size: parse_or(&lookup, "SC_MAX_MESSAGE_SIZE", "1048576")?, // 1MB
            ws_ping_interval: parse_or(&lookup, "SC_WS_PING_INTERVAL", "30")?,
            auth_timeout_seconds: parse_or(&lookup, "SC_AUTH_TIMEOUT", "10")?,
            max_connections: parse_or(&lookup, "SC_MAX_CONNECTIONS", "2000")?,
            max_connections_per_ip: parse_or(&lookup, "SC_MAX_CONNECTIONS_PER_IP", "10")?,
            cors_origins: lookup("SC_CORS_ORIGINS"),
            admin_token: lookup("SC_ADMIN_TOKEN").filter(|t| !t.is_empty()),
            prekey_low_water_mark: parse_or(&lookup, "SC_PREKEY_LOW_WATER_MARK", "10")?,
            max_one_time_prekeys: parse_or(&lookup, "SC_MAX_ONE_TIME_PREKEYS", "100")?,
            sweep_interval_seconds: parse_or(&lookup, "SC_SWEEP_INTERVAL", "60")?,
            delivered_retention_seconds: parse_or(&lookup, "SC_DELIVERED_RETENTION", "604800")?,
            device_code_ttl_seconds: parse_or(&lookup, "SC_DEVICE_CODE_TTL", "300")?,
        };

        if config.sweep_interval_seconds == 0 {
            anyhow::bail!("SC_SWEEP_INTERVAL must be at least 1 second");
        }
        if config.device_code_ttl_seconds <= 0 {
            anyhow::bail!("SC_DEVICE_CODE_TTL must be positive");
        }

        Ok(config)
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: &str) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    lookup(key)
        .unwrap_or_else(|| default.to_string())
        .parse()
        .with_context(|| format!("Invalid {key}"))
}
