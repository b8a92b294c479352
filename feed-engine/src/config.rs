//! Configuration module for the feed engine

use serde::Deserialize;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::websocket::ClientConfig;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Trading symbols to subscribe to (e.g., ["BTCUSDT", "ETHUSDT"])
    pub symbols: Vec<String>,

    /// WebSocket endpoint for Binance
    pub ws_endpoint: String,

    /// REST API endpoint for snapshots
    pub rest_endpoint: String,

    /// Order book depth levels to maintain
    pub depth_levels: usize,

    /// Capacity of each trade cache
    pub trades_limit: usize,

    /// Connection lifecycle settings
    pub connection_timeout_ms: u64,
    pub keep_alive_ms: u64,
    pub max_ping_pong_misses: u32,

    /// Reconnection settings (applied by the binary, never by the client)
    pub reconnect_delay_ms: u64,
    pub max_reconnect_attempts: u32,

    /// How many REST snapshots to try before giving up on a resync
    pub snapshot_max_retries: u32,

    /// Port of the health/metrics server
    pub health_port: u16,
}

fn var_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT,ETHUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();

        if symbols.is_empty() {
            anyhow::bail!("SYMBOLS must name at least one market");
        }

        let defaults = Self::default();
        let config = Self {
            symbols,
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            depth_levels: var_or("DEPTH_LEVELS", defaults.depth_levels),
            trades_limit: var_or("TRADES_LIMIT", defaults.trades_limit),
            connection_timeout_ms: var_or("CONNECTION_TIMEOUT_MS", defaults.connection_timeout_ms),
            keep_alive_ms: var_or("KEEP_ALIVE_MS", defaults.keep_alive_ms),
            max_ping_pong_misses: var_or("MAX_PING_PONG_MISSES", defaults.max_ping_pong_misses),
            reconnect_delay_ms: var_or("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms),
            max_reconnect_attempts: var_or("MAX_RECONNECT_ATTEMPTS", defaults.max_reconnect_attempts),
            snapshot_max_retries: var_or("SNAPSHOT_MAX_RETRIES", defaults.snapshot_max_retries),
            health_port: var_or("HEALTH_PORT", defaults.health_port),
        };

        if config.max_ping_pong_misses == 0 {
            anyhow::bail!("MAX_PING_PONG_MISSES must be at least 1");
        }

        Ok(config)
    }

    /// Lifecycle settings for a single WebSocket client
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            connection_timeout: Duration::from_millis(self.connection_timeout_ms),
            keep_alive: Duration::from_millis(self.keep_alive_ms),
            max_ping_pong_misses: self.max_ping_pong_misses,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbols: vec!["BTCUSDT".to_string()],
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            depth_levels: 20,
            trades_limit: 1000,
            connection_timeout_ms: 10_000,
            keep_alive_ms: 30_000,
            max_ping_pong_misses: 2,
            reconnect_delay_ms: 1000,
            max_reconnect_attempts: 10,
            snapshot_max_retries: 3,
            health_port: 9090,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_from_defaults() {
        let config = Config::default();
        let client = config.client_config();
        assert_eq!(client.connection_timeout, Duration::from_secs(10));
        assert_eq!(client.keep_alive, Duration::from_secs(30));
        assert_eq!(client.max_ping_pong_misses, 2);
    }
}
