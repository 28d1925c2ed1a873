//! Configuration module for the quoting service

use serde::Deserialize;
use std::env;
use std::str::FromStr;

use crate::error::{MarketDataError, Result};
use crate::orderbook::DEFAULT_PENDING_CAPACITY;
use crate::pipeline::BackpressurePolicy;
use crate::quoting::QuotingConfig;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Trading symbol (e.g., "BTCUSDT")
    pub symbol: String,

    /// WebSocket base endpoint for Binance combined streams
    pub ws_endpoint: String,

    /// REST API endpoint for snapshots
    pub rest_endpoint: String,

    /// Depth limit requested with each snapshot
    pub snapshot_depth: u32,
    pub snapshot_timeout_ms: u64,
    pub snapshot_retry_delay_ms: u64,
    pub snapshot_max_retry_delay_ms: u64,

    /// Venue event times arrive in microseconds rather than milliseconds
    pub timestamps_in_micros: bool,

    /// Bounded event channel between ingestion and the book
    pub channel_capacity: usize,
    pub backpressure: BackpressurePolicy,

    /// Diffs buffered while the book is unsynced
    pub pending_capacity: usize,

    /// Check `pu` chaining on venues that send it
    pub verify_update_chain: bool,

    /// Reconnection settings
    pub reconnect_delay_ms: u64,
    pub max_reconnect_delay_ms: u64,
    /// Consecutive failed connects before giving up (0 = never)
    pub max_reconnect_attempts: u32,

    /// IPC socket path for publishing status, disabled when unset
    pub ipc_socket_path: Option<String>,

    /// Port for the health and metrics server
    pub health_port: u16,

    /// Status log interval in seconds
    pub status_interval_secs: u64,

    /// Order book depth levels included in published state
    pub depth_levels: usize,

    pub quoting: QuotingConfig,
}

/// Parse `key` when set, otherwise fall back to `default`
fn env_or<T: FromStr>(key: &str, default: T) -> Result<T> {
    let raw = match env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw,
        _ => return Ok(default),
    };
    raw.trim().parse().map_err(|_| {
        MarketDataError::ConfigError(format!("invalid value for {}: {:?}", key, raw))
    })
}

impl Config {
    /// Load configuration from environment variables
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let quoting = QuotingConfig {
            quote_size: env_or("QUOTE_SIZE", defaults.quoting.quote_size)?,
            max_inventory: env_or("MAX_INVENTORY", defaults.quoting.max_inventory)?,
            spread_offset: env_or("SPREAD_OFFSET", defaults.quoting.spread_offset)?,
            inventory_skew: env_or("INVENTORY_SKEW", defaults.quoting.inventory_skew)?,
            max_book_spread: env_or("MAX_BOOK_SPREAD", defaults.quoting.max_book_spread)?,
        };

        let config = Self {
            symbol: env::var("SYMBOL")
                .map(|s| s.trim().to_uppercase())
                .unwrap_or(defaults.symbol),
            ws_endpoint: env::var("WS_ENDPOINT").unwrap_or(defaults.ws_endpoint),
            rest_endpoint: env::var("REST_ENDPOINT").unwrap_or(defaults.rest_endpoint),
            snapshot_depth: env_or("SNAPSHOT_DEPTH", defaults.snapshot_depth)?,
            snapshot_timeout_ms: env_or("SNAPSHOT_TIMEOUT_MS", defaults.snapshot_timeout_ms)?,
            snapshot_retry_delay_ms: env_or(
                "SNAPSHOT_RETRY_DELAY_MS",
                defaults.snapshot_retry_delay_ms,
            )?,
            snapshot_max_retry_delay_ms: env_or(
                "SNAPSHOT_MAX_RETRY_DELAY_MS",
                defaults.snapshot_max_retry_delay_ms,
            )?,
            timestamps_in_micros: env_or("TIMESTAMPS_IN_MICROS", defaults.timestamps_in_micros)?,
            channel_capacity: env_or("CHANNEL_CAPACITY", defaults.channel_capacity)?,
            backpressure: env_or("BACKPRESSURE", defaults.backpressure)?,
            pending_capacity: env_or("PENDING_CAPACITY", defaults.pending_capacity)?,
            verify_update_chain: env_or("VERIFY_UPDATE_CHAIN", defaults.verify_update_chain)?,
            reconnect_delay_ms: env_or("RECONNECT_DELAY_MS", defaults.reconnect_delay_ms)?,
            max_reconnect_delay_ms: env_or(
                "MAX_RECONNECT_DELAY_MS",
                defaults.max_reconnect_delay_ms,
            )?,
            max_reconnect_attempts: env_or(
                "MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            )?,
            ipc_socket_path: env::var("IPC_SOCKET_PATH").ok().filter(|p| !p.is_empty()),
            health_port: env_or("HEALTH_PORT", defaults.health_port)?,
            status_interval_secs: env_or("STATUS_INTERVAL_SECS", defaults.status_interval_secs)?,
            depth_levels: env_or("DEPTH_LEVELS", defaults.depth_levels)?,
            quoting,
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(MarketDataError::ConfigError(msg.to_string()));

        if self.symbol.is_empty() {
            return invalid("SYMBOL must not be empty");
        }
        if self.snapshot_depth == 0 {
            return invalid("SNAPSHOT_DEPTH must be positive");
        }
        if self.snapshot_timeout_ms == 0 {
            return invalid("SNAPSHOT_TIMEOUT_MS must be positive");
        }
        if self.channel_capacity == 0 || self.pending_capacity == 0 {
            return invalid("CHANNEL_CAPACITY and PENDING_CAPACITY must be positive");
        }
        if self.status_interval_secs == 0 {
            return invalid("STATUS_INTERVAL_SECS must be positive");
        }

        let q = &self.quoting;
        let finite = [
            q.quote_size,
            q.max_inventory,
            q.spread_offset,
            q.inventory_skew,
            q.max_book_spread,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return invalid("quoting parameters must be finite");
        }
        if q.quote_size <= 0.0 || q.max_inventory <= 0.0 {
            return invalid("QUOTE_SIZE and MAX_INVENTORY must be positive");
        }
        if q.spread_offset < 0.0 || q.max_book_spread < 0.0 {
            return invalid("SPREAD_OFFSET and MAX_BOOK_SPREAD must not be negative");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            ws_endpoint: "wss://stream.binance.com:9443".to_string(),
            rest_endpoint: "https://api.binance.com/api/v3".to_string(),
            snapshot_depth: 1000,
            snapshot_timeout_ms: 5000,
            snapshot_retry_delay_ms: 500,
            snapshot_max_retry_delay_ms: 10_000,
            timestamps_in_micros: false,
            channel_capacity: 10_000,
            backpressure: BackpressurePolicy::Block,
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            verify_update_chain: false,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30_000,
            max_reconnect_attempts: 0,
            ipc_socket_path: None,
            health_port: 9090,
            status_interval_secs: 30,
            depth_levels: 20,
            quoting: QuotingConfig::default(),
        }
    }
}
